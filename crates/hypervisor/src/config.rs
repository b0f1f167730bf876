//! Config Parser (C2)
//!
//! The VM-spec document language is a TOML subset (key/value pairs,
//! `#` comments, `[section]` tables, `[[array]]` sections), so
//! parsing/emission is built on the `toml` crate rather than a
//! hand-rolled tokenizer, with [`VMSpec`]'s own serde schema providing
//! structure on top.

use hv_types::error::{HvError, HvResult};
use hv_types::vm::{Drive, IsolationLevel, Provider, Resources, VMSpec};

/// Host capacity figures `validate` checks allocations against.
#[derive(Debug, Clone, Copy)]
pub struct HostCapacity {
    pub cpu_millicores: u32,
    pub memory_mb: u32,
    pub disk_mb: u32,
    pub network_kbps: u32,
    pub max_processes: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Parse a VM-spec document. Fails with a `validation-failed` error
/// carrying a `"parse error"`-prefixed message on malformed TOML, or
/// a `"validation error"`-prefixed message when required fields are
/// missing after successful parsing.
pub fn parse(text: &str) -> HvResult<VMSpec> {
    let spec: VMSpec = toml::from_str(text)
        .map_err(|e| HvError::validation(format!("parse error: {e}")))?;
    spec.validate()
        .map_err(|e| HvError::validation(format!("validation error: {e}")))?;
    Ok(spec)
}

/// Emit a VM-spec as a TOML document. Round-trips through [`parse`]
/// for any spec produced by [`default_template`].
pub fn emit(spec: &VMSpec) -> HvResult<String> {
    toml::to_string_pretty(spec).map_err(|e| HvError::validation(format!("emit error: {e}")))
}

/// Validate `spec` against host capacity: errors when any
/// resource dimension exceeds capacity or `name`/`image` are missing;
/// warnings when allocation exceeds 80% of any host dimension, or the
/// microvm provider carries no `kernel_image`.
pub fn validate(spec: &VMSpec, host_capacity: &HostCapacity) -> ValidationReport {
    let mut report = ValidationReport {
        valid: true,
        ..Default::default()
    };

    if spec.name.trim().is_empty() {
        report.errors.push("name is required".into());
    }
    if spec.image.trim().is_empty() {
        report.errors.push("image is required".into());
    }

    let dims: [(&str, u32, u32); 5] = [
        (
            "cpu_millicores",
            spec.resources.cpu_millicores,
            host_capacity.cpu_millicores,
        ),
        (
            "memory_mb",
            spec.resources.memory_mb,
            host_capacity.memory_mb,
        ),
        ("disk_mb", spec.resources.disk_mb, host_capacity.disk_mb),
        (
            "network_kbps",
            spec.resources.network_kbps,
            host_capacity.network_kbps,
        ),
        (
            "max_processes",
            spec.resources.max_processes,
            host_capacity.max_processes,
        ),
    ];

    for (name, requested, capacity) in dims {
        if requested > capacity {
            report.errors.push(format!(
                "resources.{name} ({requested}) exceeds host capacity ({capacity})"
            ));
        } else if capacity > 0 && (requested as f64 / capacity as f64) > 0.80 {
            report.warnings.push(format!(
                "resources.{name} allocation exceeds 80% of host capacity"
            ));
        }
    }

    if spec.provider == Provider::Microvm && spec.kernel_image.is_none() {
        report
            .warnings
            .push("microvm provider has no kernel_image".into());
    }

    report.valid = report.errors.is_empty();
    report
}

/// A sensible baseline spec per provider; the caller sets
/// `name`.
pub fn default_template(provider: Provider) -> VMSpec {
    let resources = Resources {
        cpu_millicores: 250,
        memory_mb: 128,
        disk_mb: 1024,
        network_kbps: 1024,
        max_processes: 32,
    };

    match provider {
        Provider::Container => VMSpec {
            name: String::new(),
            provider,
            image: "ubuntu:22.04".into(),
            kernel_image: None,
            isolation_level: IsolationLevel::Namespace,
            resources,
            drives: vec![],
            network_enabled: false,
            agent_id: None,
            metadata: Default::default(),
            boot_timeout_ms: 5_000,
        },
        Provider::Microvm => VMSpec {
            name: String::new(),
            provider,
            image: "rootfs.ext4".into(),
            kernel_image: Some("vmlinux".into()),
            isolation_level: IsolationLevel::Vm,
            resources,
            drives: vec![Drive {
                id: "rootfs".into(),
                host_path: "/var/lib/hypervisor/rootfs.ext4".into(),
                root: true,
                read_only: false,
            }],
            network_enabled: false,
            agent_id: None,
            metadata: Default::default(),
            boot_timeout_ms: 5_000,
        },
        Provider::Emulator => VMSpec {
            name: String::new(),
            provider,
            image: "emulator-image".into(),
            kernel_image: None,
            isolation_level: IsolationLevel::Process,
            resources,
            drives: vec![],
            network_enabled: false,
            agent_id: None,
            metadata: Default::default(),
            boot_timeout_ms: 5_000,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capacity() -> HostCapacity {
        HostCapacity {
            cpu_millicores: 4000,
            memory_mb: 8192,
            disk_mb: 102400,
            network_kbps: 10240,
            max_processes: 1024,
        }
    }

    #[test]
    fn default_templates_round_trip() {
        for provider in [Provider::Container, Provider::Microvm, Provider::Emulator] {
            let mut spec = default_template(provider);
            spec.name = "caller-supplied".into();
            let text = emit(&spec).unwrap();
            let parsed = parse(&text).unwrap();
            assert_eq!(parsed.name, spec.name);
            assert_eq!(parsed.image, spec.image);
        }
    }

    #[test]
    fn parse_rejects_malformed_document() {
        assert!(parse("not = [valid").is_err());
    }

    #[test]
    fn parse_rejects_missing_name() {
        let mut spec = default_template(Provider::Container);
        spec.name = "placeholder".into();
        let mut text = emit(&spec).unwrap();
        text = text.replacen("name = \"placeholder\"\n", "", 1);
        assert!(parse(&text).is_err());
    }

    #[test]
    fn validate_flags_excess_resources() {
        let mut spec = default_template(Provider::Container);
        spec.name = "v1".into();
        spec.resources.memory_mb = 100_000;
        let report = validate(&spec, &capacity());
        assert!(!report.valid);
        assert!(report.errors.iter().any(|e| e.contains("memory_mb")));
    }

    #[test]
    fn validate_warns_on_high_allocation() {
        let mut spec = default_template(Provider::Container);
        spec.name = "v1".into();
        spec.resources.memory_mb = 7000;
        let report = validate(&spec, &capacity());
        assert!(report.valid);
        assert!(!report.warnings.is_empty());
    }

    #[test]
    fn validate_warns_microvm_without_kernel() {
        let mut spec = default_template(Provider::Microvm);
        spec.name = "v1".into();
        spec.kernel_image = None;
        let report = validate(&spec, &capacity());
        assert!(
            report
                .warnings
                .iter()
                .any(|w| w.contains("kernel_image"))
        );
    }
}
