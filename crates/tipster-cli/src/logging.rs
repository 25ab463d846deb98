use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl LoggingConfig {
    /// `TIPSTER_LOG` sets the default level, `TIPSTER_LOG_FORMAT` picks
    /// `pretty` or `json`. `RUST_LOG` still wins when set.
    pub fn from_env() -> Self {
        Self {
            level: std::env::var("TIPSTER_LOG").unwrap_or_else(|_| "info".into()),
            format: std::env::var("TIPSTER_LOG_FORMAT").unwrap_or_else(|_| "pretty".into()),
        }
    }

    pub fn init(&self) {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level));

        match self.format.as_str() {
            "json" => {
                fmt().json().with_env_filter(filter).with_writer(std::io::stderr).init();
            }
            _ => {
                fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
            }
        }
    }
}
