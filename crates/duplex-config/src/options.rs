//! Per-engine construction options.

use duplex_protocol::{Codec, FunctionPolicy, DEFAULT_MAX_LINE_BYTES};
use serde::{Deserialize, Serialize};

use crate::{ConfigError, ConfigResult};

/// Queued outbound bytes above which `push` starts returning `false`.
pub const DEFAULT_HIGH_WATER_MARK: usize = 16 * 1024;

/// Options shared by the RPC and Pub/Sub engines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Outbound buffering threshold in bytes.
    pub high_water_mark: usize,
    /// Run the value codec. When off, values go out as their plain JSON
    /// projection and inbound typeinfo is ignored.
    pub serialize: bool,
    /// Trace every packet (id, kind, args) at debug level.
    pub debug: bool,
    /// RPC only: drop calls to unknown methods instead of answering with
    /// a not-found packet.
    pub ignore_invalid_call: bool,
    pub function_policy: FunctionPolicy,
    /// Longest packet line accepted from the peer.
    pub max_line_bytes: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            serialize: true,
            debug: false,
            ignore_invalid_call: false,
            function_policy: FunctionPolicy::default(),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

impl EngineOptions {
    pub fn with_serialize(mut self, serialize: bool) -> Self {
        self.serialize = serialize;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_ignore_invalid_call(mut self, ignore: bool) -> Self {
        self.ignore_invalid_call = ignore;
        self
    }

    pub fn with_high_water_mark(mut self, bytes: usize) -> Self {
        self.high_water_mark = bytes;
        self
    }

    pub fn with_function_policy(mut self, policy: FunctionPolicy) -> Self {
        self.function_policy = policy;
        self
    }

    pub fn with_max_line_bytes(mut self, bytes: usize) -> Self {
        self.max_line_bytes = bytes;
        self
    }

    /// The codec these options call for, `None` when serialization is off.
    pub fn codec(&self) -> Option<Codec> {
        self.serialize.then(|| Codec::new(self.function_policy))
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_line_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_line_bytes must be greater than zero".to_string(),
            ));
        }
        if self.high_water_mark == 0 {
            return Err(ConfigError::Invalid(
                "high_water_mark must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = EngineOptions::default();
        assert_eq!(options.high_water_mark, 16384);
        assert!(options.serialize);
        assert!(!options.debug);
        assert!(!options.ignore_invalid_call);
        assert_eq!(options.function_policy, FunctionPolicy::Reject);
        assert!(options.codec().is_some());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let options: EngineOptions =
            serde_json::from_str(r#"{"serialize": false, "function_policy": "opaque"}"#).unwrap();
        assert!(!options.serialize);
        assert_eq!(options.function_policy, FunctionPolicy::Opaque);
        assert_eq!(options.high_water_mark, DEFAULT_HIGH_WATER_MARK);
        assert!(options.codec().is_none());
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        assert!(EngineOptions::default().validate().is_ok());
        assert!(EngineOptions::default()
            .with_max_line_bytes(0)
            .validate()
            .is_err());
        assert!(EngineOptions::default()
            .with_high_water_mark(0)
            .validate()
            .is_err());
    }
}
