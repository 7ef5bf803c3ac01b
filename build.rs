const SECRET_KEYS: [&str; 10] = [
    "WIFI_SSID",
    "WIFI_PASS",
    "MQTT_BROKER",
    "MQTT_PORT",
    "MQTT_USER",
    "MQTT_PASS",
    "DEVICE_ID",
    "TOPIC_BASE",
    "COLOR_WIFI",
    "COLOR_NOWIFI",
];

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=secrets.local.rs");
    emit_local_secrets();
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("espidf") {
        embuild::espidf::sysenv::output();
    }
}

/// Expose `pub const NAME: &str = "..."` lines of secrets.local.rs as
/// `LOCAL_NAME` compile-time env vars.
fn emit_local_secrets() {
    let path = std::path::Path::new("secrets.local.rs");
    let Ok(src) = std::fs::read_to_string(path) else {
        return;
    };

    for key in SECRET_KEYS {
        if let Some(v) = extract_rust_str_const(&src, key) {
            println!("cargo:rustc-env=LOCAL_{}={}", key, v);
        }
    }
}

fn extract_rust_str_const(src: &str, name: &str) -> Option<String> {
    for line in src.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("//") {
            continue;
        }
        let needle = format!("pub const {}:", name);
        if !trimmed.starts_with(&needle) {
            continue;
        }
        let start = trimmed.find('"')?;
        let end = trimmed[start + 1..].find('"')? + start + 1;
        return Some(trimmed[start + 1..end].to_string());
    }
    None
}
