//! Intent taxonomy
//!
//! Maps free-form intent text to a coarse cluster and a file path to a domain
//! category. Both feed the packet key, so advice synthesized for "fixing the
//! login token check" can serve "auth middleware refactor" via relaxed lookup.

use crate::error::{Error, Result};
use regex::Regex;
use std::path::Path;

/// Cluster used when no keyword matches
pub const FALLBACK_CLUSTER: &str = "emergent_other";

/// Domain used when the path is missing or unrecognized
pub const FALLBACK_DOMAIN: &str = "general";

/// Keyword rules in priority order
const CLUSTER_RULES: &[(&str, &str)] = &[
    (
        "auth_security",
        r"(?i)\b(auth\w*|login|logout|token|jwt|oauth|password|secret|credential|permission|csrf|xss|security|encrypt\w*)\b",
    ),
    (
        "testing_validation",
        r"(?i)\b(tests?|testing|spec|assert\w*|coverage|fixture|mock\w*|validat\w*|pytest|jest|regression)\b",
    ),
    (
        "deployment_ops",
        r"(?i)\b(deploy\w*|release|rollout|ci|cd|pipeline|docker\w*|kubernetes|k8s|helm|terraform|infra\w*)\b",
    ),
    (
        "schema_contracts",
        r"(?i)\b(schema|migrations?|contract|api|endpoint|protobuf|graphql|openapi|interface|payload)\b",
    ),
    (
        "performance_latency",
        r"(?i)\b(perf\w*|latency|slow|optimi[sz]\w*|cache|caching|throughput|memory|profil\w*|benchmark\w*)\b",
    ),
    (
        "tool_reliability",
        r"(?i)\b(timeouts?|retry|retries|flaky|crash\w*|errors?|failures?|failing|broken|exception|panic\w*)\b",
    ),
    (
        "refactor_cleanup",
        r"(?i)\b(refactor\w*|cleanup|clean up|rename|extract|simplif\w*|dead code|lint\w*|format\w*)\b",
    ),
];

/// Compiled keyword taxonomy
pub struct IntentTaxonomy {
    rules: Vec<CompiledCluster>,
}

struct CompiledCluster {
    name: &'static str,
    pattern: Regex,
}

impl IntentTaxonomy {
    /// Compile the built-in cluster rules
    pub fn new() -> Result<Self> {
        let rules = CLUSTER_RULES
            .iter()
            .map(|(name, pattern)| {
                let pattern = Regex::new(pattern).map_err(|e| {
                    Error::Config(format!("Invalid intent pattern for '{}': {}", name, e))
                })?;
                Ok(CompiledCluster { name, pattern })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { rules })
    }

    /// Cluster with the most keyword hits; earlier rules win ties.
    pub fn cluster(&self, intent_context: &str) -> String {
        let mut best: Option<(&str, usize)> = None;
        for rule in &self.rules {
            let hits = rule.pattern.find_iter(intent_context).count();
            if hits > 0 && best.map(|(_, n)| hits > n).unwrap_or(true) {
                best = Some((rule.name, hits));
            }
        }
        best.map(|(name, _)| name)
            .unwrap_or(FALLBACK_CLUSTER)
            .to_string()
    }

    /// Explicit cluster when given, derived otherwise
    pub fn resolve_cluster(&self, explicit: Option<&str>, intent_context: &str) -> String {
        match explicit.map(str::trim).filter(|s| !s.is_empty()) {
            Some(cluster) => cluster.to_string(),
            None => self.cluster(intent_context),
        }
    }
}

/// Domain category from a file path
pub fn domain_for_path(path: &str) -> &'static str {
    let p = Path::new(path);
    let file_name = p
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if file_name == "dockerfile" || file_name.starts_with("docker-compose") {
        return "infra";
    }

    let ext = p
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    match ext.as_str() {
        "tsx" | "jsx" | "vue" | "svelte" | "css" | "scss" | "html" => "frontend",
        "rs" | "go" | "py" | "java" | "kt" | "rb" | "ts" | "js" | "c" | "cpp" | "cs" => {
            "backend"
        }
        "tf" | "hcl" | "yaml" | "yml" | "toml" | "sh" | "nix" => "infra",
        "md" | "rst" | "txt" | "adoc" => "docs",
        "sql" | "csv" | "parquet" | "ipynb" | "json" => "data",
        _ => FALLBACK_DOMAIN,
    }
}

/// Explicit domain when given, derived from the path otherwise
pub fn resolve_domain(explicit: Option<&str>, file_path: Option<&str>) -> String {
    if let Some(domain) = explicit.map(str::trim).filter(|s| !s.is_empty()) {
        return domain.to_string();
    }
    file_path
        .map(domain_for_path)
        .unwrap_or(FALLBACK_DOMAIN)
        .to_string()
}
