//! Config struct composition from defaults plus an optional TOML override.

/// Starts from `<$config_type>::default()` and overrides each listed field
/// present in the TOML string. Keys not in the list are rejected, all of them
/// named in one `MiradorError::Config`.
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;
        let compose = || -> Result<$config_type, $crate::MiradorError> {
            let mut config: $config_type = Default::default();
            let Some(config_str) = config_str else {
                return Ok(config);
            };

            let mut table = config_str.parse::<toml::Table>()?;
            $(
                if let Some(v) = table.remove(stringify!($field)) {
                    config.$field = v.try_into()?;
                }
            )+

            if !table.is_empty() {
                let unknown: Vec<&str> =
                    table.keys().map(|k| k.as_str()).collect();
                return Err($crate::MiradorError::Config(format!(
                    "unknown config keys {:?} for {}",
                    unknown,
                    stringify!($config_type)
                )));
            }
            Ok(config)
        };
        compose()
    }};
}
