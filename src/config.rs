// Settings document handling.
//
// The interpreter reads a small RON document next to the working
// directory. Both settings default to off, and a missing or malformed
// document degrades to the defaults with a warning rather than
// stopping the pipeline.

use ron::de::from_str;
use serde::Deserialize;
use std::fs;
use std::path::Path;


pub const SETTINGS_PATH: &str = "settings/config.ron";


#[derive(Deserialize, Debug, Copy, Clone, PartialEq, Default)]
pub struct Config {
    // Verbose tracing: token stream, AST, IR dump, and per-instruction
    // machine traces on stderr.
    #[serde(rename = "Debug", default)]
    pub debug: bool,

    // Write the IR text dump under output/<stem>/<stem>.ir.
    #[serde(rename = "GenerateOutputFile", default)]
    pub generate_output_file: bool,
}

impl Config {
    pub fn load(path: &Path) -> Config {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(_) => return Config::default(),
        };
        match from_str(&text) {
            Ok(config) => config,
            Err(_) => {
                eprintln!(
                    "warning: malformed settings in {}, using defaults",
                    path.display()
                );
                Config::default()
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_document() {
        let config: Config = from_str("(Debug: true, GenerateOutputFile: false)").unwrap();
        assert!(config.debug);
        assert!(!config.generate_output_file);
    }

    #[test]
    fn test_missing_fields_default_off() {
        let config: Config = from_str("(Debug: true)").unwrap();
        assert!(config.debug);
        assert!(!config.generate_output_file);

        let config: Config = from_str("()").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_missing_file_defaults() {
        let config = Config::load(Path::new("no/such/settings.ron"));
        assert_eq!(config, Config::default());
    }
}
