use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::ConfigError;

/// Number of random bytes in a default session id (192 bits).
const RANDOM_ID_BYTES: usize = 24;

/// Produces session identifiers.
pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> String;
}

impl<F> IdGenerator for F
where
    F: Fn() -> String + Send + Sync,
{
    fn generate(&self) -> String {
        self()
    }
}

/// Default generator: OS randomness, base64url encoded.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomIdGenerator;

impl IdGenerator for RandomIdGenerator {
    fn generate(&self) -> String {
        let mut bytes = [0u8; RANDOM_ID_BYTES];
        OsRng.fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }
}

/// UUID v4 generator.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn generate(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Named generator selectable from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdStrategy {
    #[default]
    Random,
    Uuid,
}

impl IdStrategy {
    pub const NAMES: &'static [&'static str] = &["random", "uuid"];

    pub fn generator(self) -> Arc<dyn IdGenerator> {
        match self {
            IdStrategy::Random => Arc::new(RandomIdGenerator),
            IdStrategy::Uuid => Arc::new(UuidIdGenerator),
        }
    }
}

impl std::str::FromStr for IdStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "random" => Ok(IdStrategy::Random),
            "uuid" => Ok(IdStrategy::Uuid),
            other => Err(ConfigError::InvalidGenerateId(format!(
                "unknown generator {:?}, expected one of {:?}",
                other,
                IdStrategy::NAMES
            ))),
        }
    }
}

/// Invoke a generator once so a broken one fails at setup instead of on
/// the first request.
pub(crate) fn probe(generator: &dyn IdGenerator) -> Result<(), ConfigError> {
    let id = generator.generate();
    if id.is_empty() {
        return Err(ConfigError::InvalidGenerateId(
            "generator returned an empty id".to_string(),
        ));
    }
    if !codec::is_valid_value(&id) {
        return Err(ConfigError::InvalidGenerateId(format!(
            "generator returned an id that cannot be carried in a cookie: {:?}",
            id
        )));
    }
    Ok(())
}
