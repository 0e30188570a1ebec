//! Emits the esp-idf link configuration and surfaces Wi-Fi credentials from
//! a local `.env` as compile-time env vars for the `env!` calls in main.

/// Keys `main.rs` consumes at compile time.
const REQUIRED_KEYS: [&str; 2] = ["WIFI_SSID", "WIFI_PASS"];

fn main() {
    embuild::espidf::sysenv::output();

    println!("cargo::rerun-if-changed=.env");

    let mut env_vars: Vec<(String, String)> = Vec::new();
    if let Ok(iter) = dotenvy::dotenv_iter() {
        for (key, val) in iter.flatten() {
            env_vars.push((key, val));
        }
    }
    for (key, val) in &env_vars {
        println!("cargo::rustc-env={key}={val}");
    }

    for key in REQUIRED_KEYS {
        let in_dotenv = env_vars.iter().any(|(k, _)| k == key);
        if !in_dotenv && std::env::var(key).is_err() {
            println!("cargo::warning={key} is unset; copy .env.example to .env and fill it in");
        }
    }
}
