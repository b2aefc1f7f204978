//! Build script for flowdisp-runtime
//!
//! Handles configuration merging:
//! 1. Start with library defaults
//! 2. If FDP_CONFIG_RS env var is set, parse the user's config file
//! 3. Merge user values over defaults (user wins)
//! 4. Generate OUT_DIR/fdp_merged_config.rs
//!
//! The user file only lists the values it changes.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

struct ConfigParam {
    name: &'static str,
    rust_type: &'static str,
    default_value: &'static str,
}

const CONFIG_PARAMS: &[ConfigParam] = &[
    ConfigParam {
        name: "DIRECT_DISPATCH",
        rust_type: "bool",
        default_value: "true",
    },
    ConfigParam {
        name: "MAX_THREADS",
        rust_type: "usize",
        default_value: "256",
    },
    ConfigParam {
        name: "BIND_THREADS",
        rust_type: "bool",
        default_value: "false",
    },
    ConfigParam {
        name: "DEFAULT_QLIMIT",
        rust_type: "usize",
        default_value: "256",
    },
    ConfigParam {
        name: "MAX_QLIMIT",
        rust_type: "usize",
        default_value: "10240",
    },
    ConfigParam {
        name: "REGISTRY_LOCK",
        rust_type: "bool",
        default_value: "false",
    },
    ConfigParam {
        name: "DEFAULT_AFFINITY_STRONG",
        rust_type: "bool",
        default_value: "false",
    },
    ConfigParam {
        name: "DEBUG_LOGGING",
        rust_type: "bool",
        default_value: "false",
    },
];

fn main() {
    let out_dir = env::var("OUT_DIR").expect("OUT_DIR not set");
    let dest_path = Path::new(&out_dir).join("fdp_merged_config.rs");

    let mut config: HashMap<&str, String> = CONFIG_PARAMS
        .iter()
        .map(|p| (p.name, p.default_value.to_string()))
        .collect();

    if let Ok(user_path) = env::var("FDP_CONFIG_RS") {
        println!("cargo:rerun-if-changed={}", user_path);

        match fs::read_to_string(&user_path) {
            Ok(content) => {
                parse_and_merge(&content, &mut config);
                println!("cargo:warning=Using custom config: {}", user_path);
            }
            Err(e) => {
                println!(
                    "cargo:warning=Failed to read FDP_CONFIG_RS ({}): {}",
                    user_path, e
                );
            }
        }
    }

    println!("cargo:rerun-if-env-changed=FDP_CONFIG_RS");

    let output = generate_config(&config);
    fs::write(&dest_path, &output).expect("Failed to write merged config");
}

/// Merge `pub const NAME: TYPE = VALUE;` lines for known parameters
fn parse_and_merge(content: &str, config: &mut HashMap<&str, String>) {
    for line in content.lines() {
        let line = line.trim();

        if line.is_empty() || line.starts_with("//") || !line.starts_with("pub const ") {
            continue;
        }

        let Some((name, value)) = parse_const_line(line) else {
            continue;
        };

        match CONFIG_PARAMS.iter().find(|p| p.name == name) {
            Some(param) => {
                config.insert(param.name, value);
            }
            None => println!("cargo:warning=Unknown config parameter: {}", name),
        }
    }
}

/// Parse `pub const NAME: TYPE = VALUE;` into (NAME, VALUE)
fn parse_const_line(line: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix("pub const ")?.trim();

    let colon_pos = rest.find(':')?;
    let name = rest[..colon_pos].trim().to_string();

    let eq_pos = rest.find('=')?;
    let semi_pos = rest.rfind(';').unwrap_or(rest.len());
    let value = rest[eq_pos + 1..semi_pos].trim().to_string();

    Some((name, value))
}

fn generate_config(config: &HashMap<&str, String>) -> String {
    let mut output = String::new();

    output.push_str("// Auto-generated by build.rs - do not edit\n");
    output.push_str("// Configuration merged from library defaults");
    if env::var("FDP_CONFIG_RS").is_ok() {
        output.push_str(" and user's fdp_config.rs");
    }
    output.push_str("\n\n");

    for param in CONFIG_PARAMS {
        let value = config
            .get(param.name)
            .map(String::as_str)
            .unwrap_or(param.default_value);
        output.push_str(&format!(
            "pub const {}: {} = {};\n",
            param.name, param.rust_type, value
        ));
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_const_line() {
        let result = parse_const_line("pub const MAX_THREADS: usize = 8;");
        assert_eq!(result, Some(("MAX_THREADS".into(), "8".into())));

        let result = parse_const_line("pub const DIRECT_DISPATCH: bool = false;");
        assert_eq!(result, Some(("DIRECT_DISPATCH".into(), "false".into())));

        let result = parse_const_line("pub const MAX_QLIMIT: usize = 10 * 1024;");
        assert_eq!(result, Some(("MAX_QLIMIT".into(), "10 * 1024".into())));
    }

    #[test]
    fn test_parse_and_merge_ignores_unknown() {
        let mut config: HashMap<&str, String> = HashMap::new();
        config.insert("MAX_THREADS", "256".into());
        config.insert("DEFAULT_QLIMIT", "256".into());

        let user_config = r#"
            // tuned for a 4-core box
            pub const MAX_THREADS: usize = 4;
            pub const DEFAULT_QLIMIT: usize = 1024;
            pub const TURBO: bool = true;
        "#;

        parse_and_merge(user_config, &mut config);

        assert_eq!(config.get("MAX_THREADS"), Some(&"4".to_string()));
        assert_eq!(config.get("DEFAULT_QLIMIT"), Some(&"1024".to_string()));
        assert!(config.get("TURBO").is_none());
    }
}
