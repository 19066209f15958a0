//! Loads the `[dpdce]` INI section into an explicit [`EngineConfig`] value
//! passed to every component, rather than module-level globals.

use crate::error::ConfigError;
use ini::Ini;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

const SECTION: &str = "dpdce";

/// Parsed `[dpdce]` configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub control_port: u16,
    pub dpd_port: u16,
    pub rc_port: u16,
    pub samplerate: u32,
    pub samps: u32,
    pub coef_file: PathBuf,
    pub logs_directory: PathBuf,
    pub plot_directory: PathBuf,
    /// Host the modulator's DPD feedback and RC ports are reachable on.
    /// Not an INI key in its own right; it is the address those ports are
    /// resolved against and defaults to localhost.
    pub modulator_host: IpAddr,
}

impl EngineConfig {
    pub fn dpd_feedback_addr(&self) -> SocketAddr {
        SocketAddr::new(self.modulator_host, self.dpd_port)
    }

    pub fn rc_addr(&self) -> SocketAddr {
        SocketAddr::new(self.modulator_host, self.rc_port)
    }

    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.control_port)
    }

    /// Load and validate `[dpdce]` from an INI file at `path`.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_file(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
        })?;
        let section = ini
            .section(Some(SECTION))
            .ok_or_else(|| ConfigError::MissingSection {
                path: path.display().to_string(),
            })?;

        let get = |key: &str| -> Result<String, ConfigError> {
            section
                .get(key)
                .map(String::from)
                .ok_or_else(|| ConfigError::InvalidKey { key: key.to_string() })
        };
        let parse_u16 = |key: &str| -> Result<u16, ConfigError> {
            get(key)?
                .parse()
                .map_err(|_| ConfigError::InvalidKey { key: key.to_string() })
        };
        let parse_u32 = |key: &str| -> Result<u32, ConfigError> {
            get(key)?
                .parse()
                .map_err(|_| ConfigError::InvalidKey { key: key.to_string() })
        };

        Ok(EngineConfig {
            control_port: parse_u16("control_port")?,
            dpd_port: parse_u16("dpd_port")?,
            rc_port: parse_u16("rc_port")?,
            samplerate: parse_u32("samplerate")?,
            samps: parse_u32("samps")?,
            coef_file: PathBuf::from(get("coef_file")?),
            logs_directory: PathBuf::from(get("logs_directory")?),
            plot_directory: PathBuf::from(get("plot_directory")?),
            modulator_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        })
    }
}

impl Default for EngineConfig {
    /// Defaults: samplerate 8 192 000 Hz, samps 81 920.
    fn default() -> Self {
        EngineConfig {
            control_port: 50056,
            dpd_port: 50055,
            rc_port: 9400,
            samplerate: 8_192_000,
            samps: 81_920,
            coef_file: PathBuf::from("dpd_coefs.txt"),
            logs_directory: PathBuf::from("logs"),
            plot_directory: PathBuf::from("plots"),
            modulator_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_a_well_formed_section() {
        let dir = std::env::temp_dir().join(format!("dpdce-config-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("dpdce.ini");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[dpdce]\ncontrol_port=50056\ndpd_port=50055\nrc_port=9400\nsamplerate=8192000\nsamps=81920\ncoef_file=coef.txt\nlogs_directory=logs\nplot_directory=plots\n"
        )
        .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.dpd_port, 50055);
        assert_eq!(config.samplerate, 8_192_000);
        assert_eq!(config.samps, 81_920);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_section_is_an_error() {
        let dir = std::env::temp_dir().join(format!("dpdce-config-test2-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("empty.ini");
        std::fs::write(&path, "[other]\nkey=value\n").unwrap();

        assert!(matches!(
            EngineConfig::load(&path),
            Err(ConfigError::MissingSection { .. })
        ));

        std::fs::remove_dir_all(&dir).ok();
    }
}
