//! Hash command - Produce a password hash in a service's format

use clap::{Args, ValueEnum};

use svchub_connector::credentials::{DEFAULT_BCRYPT_COST, DEFAULT_PHPASS_ROUNDS};
use svchub_connector::{CredentialGenerator, HashScheme};

use crate::error::{CliError, CliResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SchemeArg {
    Bcrypt,
    Phpass,
    #[value(name = "sha1-username")]
    Sha1Username,
    Sha1,
    Md5,
}

/// Arguments for the hash command
#[derive(Args, Debug)]
pub struct HashArgs {
    /// Hash format
    #[arg(value_enum)]
    pub scheme: SchemeArg,

    /// Username, required by sha1-username
    #[arg(long)]
    pub username: Option<String>,

    /// Password to hash; a random one is generated when omitted
    #[arg(long, env = "SVCHUB_HASH_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// bcrypt cost or phpass rounds (log2)
    #[arg(long)]
    pub cost: Option<u32>,
}

pub(crate) fn scheme_for(args: &HashArgs) -> CliResult<HashScheme> {
    Ok(match args.scheme {
        SchemeArg::Bcrypt => HashScheme::Bcrypt {
            cost: args.cost.unwrap_or(DEFAULT_BCRYPT_COST),
        },
        SchemeArg::Phpass => HashScheme::Phpass {
            rounds_log2: match args.cost {
                None => DEFAULT_PHPASS_ROUNDS,
                Some(c) => u8::try_from(c)
                    .map_err(|_| CliError::Validation(format!("rounds {c} out of range")))?,
            },
        },
        SchemeArg::Sha1Username => {
            if args.username.is_none() {
                return Err(CliError::Validation(
                    "sha1-username requires --username".to_string(),
                ));
            }
            HashScheme::Sha1UsernamePassword
        }
        SchemeArg::Sha1 => HashScheme::Sha1Password,
        SchemeArg::Md5 => HashScheme::Md5Password,
    })
}

pub fn execute(args: HashArgs) -> CliResult<()> {
    let scheme = scheme_for(&args)?;
    let username = args.username.as_deref().unwrap_or_default();

    let generated = args.password.is_none();
    let password = args
        .password
        .clone()
        .unwrap_or_else(CredentialGenerator::generate_legacy_password);

    let hashed = CredentialGenerator::hash_for(scheme, username, &password)
        .map_err(|e| CliError::Validation(e.to_string()))?;

    if generated {
        println!("password: {password}");
    }
    println!("{}: {}", scheme.name(), hashed.hash);
    if let Some(salt) = hashed.salt {
        println!("salt: {salt}");
    }
    Ok(())
}
