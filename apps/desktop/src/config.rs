use std::{collections::HashMap, fs};

#[derive(Debug, Clone)]
pub struct Settings {
    pub server_url: String,
    pub auth_token: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:4000".into(),
            auth_token: None,
        }
    }
}

/// Defaults, overridden by `client.toml`, overridden by environment.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("client.toml") {
        apply_file_overrides(&mut settings, &raw);
    }

    if let Ok(v) = std::env::var("SERVER_URL") {
        settings.server_url = v;
    }
    if let Ok(v) = std::env::var("APP__SERVER_URL") {
        settings.server_url = v;
    }

    if let Ok(v) = std::env::var("AUTH_TOKEN") {
        settings.auth_token = Some(v);
    }
    if let Ok(v) = std::env::var("APP__AUTH_TOKEN") {
        settings.auth_token = Some(v);
    }

    settings
}

fn apply_file_overrides(settings: &mut Settings, raw: &str) {
    if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(raw) {
        if let Some(v) = file_cfg.get("server_url") {
            settings.server_url = v.clone();
        }
        if let Some(v) = file_cfg.get("auth_token") {
            settings.auth_token = Some(v.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_overrides_replace_defaults() {
        let mut settings = Settings::default();
        apply_file_overrides(
            &mut settings,
            "server_url = \"https://attendance.example.com\"\nauth_token = \"t-123\"\n",
        );
        assert_eq!(settings.server_url, "https://attendance.example.com");
        assert_eq!(settings.auth_token.as_deref(), Some("t-123"));
    }

    #[test]
    fn unknown_keys_and_bad_toml_leave_defaults_alone() {
        let mut settings = Settings::default();
        apply_file_overrides(&mut settings, "retries = \"3\"\n");
        apply_file_overrides(&mut settings, "not toml at all");
        assert_eq!(settings.server_url, Settings::default().server_url);
        assert_eq!(settings.auth_token, None);
    }
}
