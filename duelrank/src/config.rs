// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of duelrank.
//
// duelrank is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// duelrank is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with duelrank.  If not,
// see <http://www.gnu.org/licenses/>.

//! # configuration
//!
//! duelrank reads a YAML configuration file with `server`/`app`/`database` sections. The
//! `CONFIG_NAME` environment variable selects the file's basename (default `config`), searched
//! first in `./config/`, then in the working directory. Individual environment variables override
//! file values — env beats file, file beats default.

use std::{env, path::PathBuf};

use serde::Deserialize;
use snafu::{Backtrace, ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Unable to read configuration file {pth:?}: {source}"))]
    NotFound {
        pth: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("No configuration file named {name}.yaml under ./config or ."))]
    NoCandidate { name: String, backtrace: Backtrace },
    #[snafu(display("Error parsing configuration file {pth:?}: {source}"))]
    Parse {
        pth: PathBuf,
        source: serde_yaml::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub app: AppConfig,
    pub database: DatabaseConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig::default(),
            app: AppConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the public listener to, as "host:port"
    pub address: String,
    pub cors: CorsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            address: "0.0.0.0:8080".to_owned(),
            cors: CorsConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    #[serde(rename = "allowedOrigins")]
    pub allowed_origins: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Prefix prepended to item sprite handles when composing image URLs
    #[serde(rename = "imageBaseUrl")]
    pub image_base_url: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            image_base_url: "/images/items/".to_owned(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub redis: RedisConfig,
    pub sqlite: SqliteConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub address: String,
    pub password: String,
    pub db: i64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        RedisConfig {
            address: "localhost:6379".to_owned(),
            password: String::new(),
            db: 0,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    #[serde(rename = "fileName")]
    pub file_name: String,
    #[serde(rename = "maxCacheSizeKB")]
    pub max_cache_size_kb: i64,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        SqliteConfig {
            file_name: "duelrank.db".to_owned(),
            max_cache_size_kb: 65536,
        }
    }
}

/// Locate, load & parse the configuration
///
/// `explicit` (from the command line) short-circuits the search. Missing file with no explicit
/// path falls back to defaults — convenient for development; a misconfigured *explicit* path is an
/// error.
pub fn load(explicit: Option<&PathBuf>) -> Result<Config> {
    let mut cfg = match explicit {
        Some(pth) => parse(pth)?,
        None => {
            let name = env::var("CONFIG_NAME").unwrap_or_else(|_| "config".to_owned());
            let candidates = [
                PathBuf::from("config").join(format!("{}.yaml", name)),
                PathBuf::from(format!("{}.yaml", name)),
            ];
            match candidates.iter().find(|p| p.exists()) {
                Some(pth) => parse(pth)?,
                None => Config::default(),
            }
        }
    };
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

fn parse(pth: &PathBuf) -> Result<Config> {
    let text = std::fs::read_to_string(pth).context(NotFoundSnafu { pth: pth.clone() })?;
    serde_yaml::from_str(&text).context(ParseSnafu { pth: pth.clone() })
}

/// Environment beats file; the variable names mirror the YAML paths
fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = env::var("SERVER_ADDRESS") {
        cfg.server.address = v;
    }
    if let Ok(v) = env::var("DATABASE_REDIS_ADDRESS") {
        cfg.database.redis.address = v;
    }
    if let Ok(v) = env::var("DATABASE_REDIS_PASSWORD") {
        cfg.database.redis.password = v;
    }
    if let Ok(v) = env::var("DATABASE_REDIS_DB") {
        if let Ok(db) = v.parse() {
            cfg.database.redis.db = db;
        }
    }
    if let Ok(v) = env::var("DATABASE_SQLITE_FILENAME") {
        cfg.database.sqlite.file_name = v;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_the_documented_shape() {
        let text = r#"
server:
  address: "127.0.0.1:9000"
  cors:
    allowedOrigins:
      - "http://localhost:3000"
app:
  imageBaseUrl: "/images/things/"
database:
  redis:
    address: "redis:6379"
    db: 2
  sqlite:
    fileName: "ranks.db"
    maxCacheSizeKB: 1024
"#;
        let cfg: Config = serde_yaml::from_str(text).unwrap();
        assert_eq!(cfg.server.address, "127.0.0.1:9000");
        assert_eq!(cfg.server.cors.allowed_origins, vec!["http://localhost:3000"]);
        assert_eq!(cfg.app.image_base_url, "/images/things/");
        assert_eq!(cfg.database.redis.address, "redis:6379");
        assert_eq!(cfg.database.redis.db, 2);
        assert_eq!(cfg.database.sqlite.file_name, "ranks.db");
        assert_eq!(cfg.database.sqlite.max_cache_size_kb, 1024);
    }

    #[test]
    fn partial_files_fall_back_to_defaults() {
        let cfg: Config = serde_yaml::from_str("server:\n  address: \":1234\"\n").unwrap();
        assert_eq!(cfg.server.address, ":1234");
        assert_eq!(cfg.database.redis.address, "localhost:6379");
        assert_eq!(cfg.database.sqlite.file_name, "duelrank.db");
    }
}
