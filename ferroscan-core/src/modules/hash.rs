//! META_HASH module
//!
//! Records digests of the object buffer. All three digests are computed by
//! default; the `algos` option narrows the set (`algos=md5,sha256`).

use md5::Digest as _;

use crate::error::{ModuleError, ModuleResult};
use crate::module::{ModuleContext, ModuleOutput, ScanModule};
use crate::object::ScanObject;

/// Digest module
pub struct MetaHash;

const ALL_ALGOS: [&str; 3] = ["md5", "sha1", "sha256"];

impl ScanModule for MetaHash {
    fn name(&self) -> &'static str {
        "META_HASH"
    }

    fn scan(&self, object: &ScanObject, ctx: &ModuleContext<'_>) -> ModuleResult<ModuleOutput> {
        let selected: Vec<String> = match ctx.options.get("algos") {
            None => ALL_ALGOS.iter().map(|s| s.to_string()).collect(),
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_lowercase)
                .collect(),
        };

        let mut output = ModuleOutput::new();
        for algo in &selected {
            let digest = match algo.as_str() {
                "md5" => hex::encode(md5::Md5::digest(object.buffer())),
                "sha1" => hex::encode(sha1::Sha1::digest(object.buffer())),
                "sha256" => hex::encode(sha2::Sha256::digest(object.buffer())),
                other => {
                    return Err(ModuleError::InvalidOptions(format!(
                        "unknown digest '{}'",
                        other
                    )))
                }
            };
            output.add_metadata(algo.as_str(), digest);
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{Deadline, ModuleOptions};
    use crate::object::{ExternalVars, HashKind};
    use std::time::Duration;

    fn ctx<'a>(external: &'a ExternalVars, options: ModuleOptions) -> ModuleContext<'a> {
        ModuleContext {
            external,
            options,
            depth: 0,
            deadline: Deadline::after(Duration::from_secs(10)),
        }
    }

    #[test]
    fn test_all_digests_by_default() {
        let external = ExternalVars::default();
        let object = ScanObject::root(b"abc".to_vec(), &external, HashKind::Sha256);

        let output = MetaHash
            .scan(&object, &ctx(&external, ModuleOptions::new()))
            .unwrap();

        assert_eq!(output.metadata.len(), 3);
        let (field, value) = &output.metadata[0];
        assert_eq!(field.as_str(), "md5");
        assert_eq!(
            *value,
            crate::metadata::MetaValue::from("900150983cd24fb0d6963f7d28e17f72")
        );
    }

    #[test]
    fn test_algos_option_narrows() {
        let external = ExternalVars::default();
        let object = ScanObject::root(b"abc".to_vec(), &external, HashKind::Sha256);
        let options = ModuleOptions::new().with("algos", "sha256");

        let output = MetaHash.scan(&object, &ctx(&external, options)).unwrap();
        assert_eq!(output.metadata.len(), 1);
        assert_eq!(output.metadata[0].0.as_str(), "sha256");
    }

    #[test]
    fn test_unknown_algo_rejected() {
        let external = ExternalVars::default();
        let object = ScanObject::root(b"abc".to_vec(), &external, HashKind::Sha256);
        let options = ModuleOptions::new().with("algos", "crc64");

        let result = MetaHash.scan(&object, &ctx(&external, options));
        assert!(matches!(result, Err(ModuleError::InvalidOptions(_))));
    }
}
