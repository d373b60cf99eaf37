use std::{ffi::OsString, fs::File, io::BufReader, path::PathBuf};

use clap_serde_derive::{
    clap::{self, Parser},
    ClapSerde,
};
use home::home_dir;
use serde::Deserialize;
use tracing::warn;

use crate::{Error, LightningConfig, Result};

const DEFAULT_CONFIG_FILE_NAME: &str = "config.yml";
const DEFAULT_LIGHTNING_DIR_NAME: &str = "lightning";

fn get_base_dir() -> PathBuf {
    let mut path = home_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(".lnwallet");
    path
}

fn get_default_config_file() -> PathBuf {
    let mut path = get_base_dir();
    path.push(DEFAULT_CONFIG_FILE_NAME);
    path
}

#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    // An explicit config path wins; otherwise `config.yml` under the base dir is used,
    // so we must know whether `base_dir` was given by the user.
    /// config file
    #[arg(short, long = "config", help = format!("config file [default: {:?} or $BASE_DIR/config.yml]", get_default_config_file()))]
    config_path: Option<PathBuf>,

    /// base directory
    #[arg(short = 'd', long = "dir", help = format!("base directory for all [default: {:?}]", get_base_dir()))]
    base_dir: Option<PathBuf>,

    /// config for the lightning core
    #[command(flatten)]
    pub lightning: <LightningConfig as ClapSerde>::Opt,
}

#[derive(Deserialize)]
struct SerializedConfig {
    lightning: Option<<LightningConfig as ClapSerde>::Opt>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub base_dir: PathBuf,
    pub lightning: LightningConfig,
}

impl Config {
    /// Parse the process arguments, merged over the YAML config file.
    pub fn parse() -> Result<Self> {
        Self::parse_from(std::env::args_os())
    }

    pub fn parse_from<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let mut args = Args::try_parse_from(args)
            .map_err(|err| Error::InvalidParameter(err.to_string()))?;

        let base_dir = args.base_dir.clone().unwrap_or_else(get_base_dir);
        let config_file = args
            .config_path
            .clone()
            .or(args.base_dir.as_ref().map(|x| x.join(DEFAULT_CONFIG_FILE_NAME)))
            .unwrap_or_else(get_default_config_file);

        let config_from_file = match File::open(&config_file) {
            Ok(file) => Some(
                serde_yaml::from_reader::<_, SerializedConfig>(BufReader::new(file)).map_err(
                    |err| {
                        Error::InvalidParameter(format!(
                            "invalid config file {:?}: {}",
                            config_file, err
                        ))
                    },
                )?,
            ),
            Err(err) => {
                if args.config_path.is_some() {
                    return Err(err.into());
                }
                warn!("No config file found at {:?}, using defaults", config_file);
                None
            }
        };

        let mut lightning = match config_from_file.and_then(|c| c.lightning) {
            Some(from_file) => LightningConfig::from(from_file).merge(&mut args.lightning),
            None => LightningConfig::from(&mut args.lightning),
        };
        if lightning.base_dir.is_none() {
            lightning.base_dir = Some(base_dir.join(DEFAULT_LIGHTNING_DIR_NAME));
        }

        Ok(Self {
            base_dir,
            lightning,
        })
    }
}
