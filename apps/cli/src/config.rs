use std::{collections::HashMap, fs, path::PathBuf};

#[derive(Debug)]
pub struct Settings {
    pub server_url: String,
    pub uploads_path: String,
    pub output_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:5000".into(),
            uploads_path: "/uploads".into(),
            output_dir: PathBuf::from("./translated"),
        }
    }
}

/// Defaults, overridden by an optional `imgtrans.toml` next to the binary,
/// overridden in turn by environment variables.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("imgtrans.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("server_url") {
                settings.server_url = v.clone();
            }
            if let Some(v) = file_cfg.get("uploads_path") {
                settings.uploads_path = v.clone();
            }
            if let Some(v) = file_cfg.get("output_dir") {
                settings.output_dir = PathBuf::from(v);
            }
        }
    }

    if let Ok(v) = std::env::var("IMGTRANS_SERVER_URL") {
        settings.server_url = v;
    }
    if let Ok(v) = std::env::var("IMGTRANS_UPLOADS_PATH") {
        settings.uploads_path = v;
    }
    if let Ok(v) = std::env::var("IMGTRANS_OUTPUT_DIR") {
        settings.output_dir = PathBuf::from(v);
    }

    settings
}
