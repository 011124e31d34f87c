use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::tools::{FunctionSpec, MITRE_TOOL_NAME, Tool, ToolArgs, ToolError, unknown_function};

pub const ATTACK_DOMAINS: [&str; 3] = ["enterprise-attack", "mobile-attack", "ics-attack"];

const FUNCTIONS: &[FunctionSpec] = &[
    FunctionSpec::new(
        "search_techniques",
        &["keyword"],
        "techniques whose name or description mention the keyword",
    ),
    FunctionSpec::new(
        "get_technique_by_id",
        &["attack_id"],
        "one technique by ATT&CK id, e.g. T1059",
    ),
    FunctionSpec::new(
        "get_mitigations_for_technique",
        &["attack_id"],
        "mitigations for one technique id",
    ),
    FunctionSpec::new(
        "get_mitigations_by_keyword",
        &["keyword"],
        "techniques matching a keyword, each with its mitigations",
    ),
    FunctionSpec::new(
        "get_techniques_for_mitigation",
        &["mitigation_id"],
        "techniques mitigated by one mitigation id, e.g. M1036",
    ),
];

#[derive(Debug, Deserialize)]
struct StixBundle {
    #[serde(default)]
    objects: Vec<StixObject>,
}

#[derive(Debug, Clone, Deserialize)]
struct StixObject {
    #[serde(rename = "type")]
    kind: String,
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    external_references: Vec<ExternalReference>,
    #[serde(default)]
    relationship_type: Option<String>,
    #[serde(default)]
    source_ref: Option<String>,
    #[serde(default)]
    target_ref: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ExternalReference {
    #[serde(default)]
    external_id: Option<String>,
}

impl StixObject {
    fn external_id(&self) -> Option<&str> {
        self.external_references
            .iter()
            .find_map(|reference| reference.external_id.as_deref())
    }

    fn matches_keyword(&self, needle: &str) -> bool {
        self.name.to_lowercase().contains(needle) || self.description.to_lowercase().contains(needle)
    }
}

/// One ATT&CK matrix loaded from its STIX bundle.
#[derive(Debug)]
pub struct AttackDomain {
    name: String,
    objects: Vec<StixObject>,
    by_stix_id: HashMap<String, usize>,
    // (mitigation stix id, technique stix id)
    mitigates: Vec<(String, String)>,
}

impl AttackDomain {
    pub fn from_bundle(name: &str, bundle: &str) -> Result<Self> {
        let bundle = serde_json::from_str::<StixBundle>(bundle)
            .with_context(|| format!("failed to parse MITRE bundle '{name}'"))?;
        let by_stix_id = bundle
            .objects
            .iter()
            .enumerate()
            .map(|(index, object)| (object.id.clone(), index))
            .collect();
        let mitigates = bundle
            .objects
            .iter()
            .filter(|object| {
                object.kind == "relationship"
                    && object.relationship_type.as_deref() == Some("mitigates")
            })
            .filter_map(|object| Some((object.source_ref.clone()?, object.target_ref.clone()?)))
            .collect();
        Ok(Self {
            name: name.to_string(),
            objects: bundle.objects,
            by_stix_id,
            mitigates,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn by_stix_id(&self, id: &str) -> Option<&StixObject> {
        self.by_stix_id.get(id).map(|index| &self.objects[*index])
    }

    fn of_kind(&self, kind: &'static str) -> impl Iterator<Item = &StixObject> {
        self.objects.iter().filter(move |object| object.kind == kind)
    }

    fn by_attack_id(&self, attack_id: &str, kind: &'static str) -> Option<&StixObject> {
        self.of_kind(kind)
            .find(|object| object.external_id() == Some(attack_id))
    }

    fn mitigations_of(&self, technique: &StixObject) -> Vec<Value> {
        self.mitigates
            .iter()
            .filter(|(_, target)| *target == technique.id)
            .filter_map(|(source, _)| self.by_stix_id(source))
            .map(|mitigation| {
                json!({
                    "mitigation_id": mitigation.external_id(),
                    "name": mitigation.name,
                    "description": mitigation.description,
                })
            })
            .collect()
    }
}

/// Offline ATT&CK lookups across the enterprise, mobile and ICS matrices.
pub struct MitreTool {
    domains: Vec<AttackDomain>,
}

impl MitreTool {
    pub fn new(domains: Vec<AttackDomain>) -> Self {
        Self { domains }
    }

    /// Loads `<domain>.json` for every known domain under `data_dir`.
    /// Missing or unreadable bundles are skipped.
    pub fn load(data_dir: &Path) -> Self {
        let mut domains = Vec::new();
        for domain in ATTACK_DOMAINS {
            let path = data_dir.join(format!("{domain}.json"));
            let loaded = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read '{}'", path.display()))
                .and_then(|text| AttackDomain::from_bundle(domain, &text));
            match loaded {
                Ok(parsed) => {
                    tracing::info!(domain, path = %path.display(), "Loaded MITRE dataset");
                    domains.push(parsed);
                }
                Err(err) => {
                    tracing::warn!(domain, error = %format!("{err:#}"), "MITRE dataset unavailable");
                }
            }
        }
        Self::new(domains)
    }

    pub fn loaded_domains(&self) -> Vec<&str> {
        self.domains.iter().map(AttackDomain::name).collect()
    }

    pub fn search_techniques(&self, keyword: &str) -> Value {
        let needle = keyword.to_lowercase();
        let mut results = Vec::new();
        for domain in &self.domains {
            for technique in domain.of_kind("attack-pattern") {
                let Some(tech_id) = technique.external_id() else {
                    continue;
                };
                if technique.matches_keyword(&needle) {
                    results.push(json!({
                        "domain": domain.name,
                        "tech_id": tech_id,
                        "technique": technique.name,
                        "description": technique.description,
                    }));
                }
            }
        }
        Value::Array(results)
    }

    pub fn get_technique_by_id(&self, attack_id: &str) -> Value {
        self.domains
            .iter()
            .find_map(|domain| {
                let technique = domain.by_attack_id(attack_id, "attack-pattern")?;
                Some(json!({
                    "domain": domain.name,
                    "tech_id": attack_id,
                    "technique": technique.name,
                    "description": technique.description,
                }))
            })
            .unwrap_or(Value::Null)
    }

    pub fn get_mitigations_for_technique(&self, attack_id: &str) -> Value {
        self.domains
            .iter()
            .find_map(|domain| {
                let technique = domain.by_attack_id(attack_id, "attack-pattern")?;
                Some(json!({
                    "domain": domain.name,
                    "technique_id": attack_id,
                    "technique": technique.name,
                    "mitigations": domain.mitigations_of(technique),
                }))
            })
            .unwrap_or(Value::Null)
    }

    pub fn get_mitigations_by_keyword(&self, keyword: &str) -> Value {
        let needle = keyword.to_lowercase();
        let mut results = Vec::new();
        for domain in &self.domains {
            for technique in domain.of_kind("attack-pattern") {
                let Some(tech_id) = technique.external_id() else {
                    continue;
                };
                if technique.matches_keyword(&needle) {
                    results.push(json!({
                        "domain": domain.name,
                        "technique_id": tech_id,
                        "technique": technique.name,
                        "mitigations": domain.mitigations_of(technique),
                    }));
                }
            }
        }
        Value::Array(results)
    }

    pub fn get_techniques_for_mitigation(&self, mitigation_id: &str) -> Value {
        let mut results = Vec::new();
        for domain in &self.domains {
            let Some(mitigation) = domain.by_attack_id(mitigation_id, "course-of-action") else {
                continue;
            };
            for (_, target) in domain
                .mitigates
                .iter()
                .filter(|(source, _)| *source == mitigation.id)
            {
                if let Some(technique) = domain.by_stix_id(target) {
                    results.push(json!({
                        "domain": domain.name,
                        "technique_id": technique.external_id(),
                        "technique": technique.name,
                        "description": technique.description,
                    }));
                }
            }
        }
        Value::Array(results)
    }
}

#[async_trait]
impl Tool for MitreTool {
    fn name(&self) -> &str {
        MITRE_TOOL_NAME
    }

    fn description(&self) -> &str {
        "MITRE ATT&CK techniques and mitigations (offline STIX data)"
    }

    fn functions(&self) -> &[FunctionSpec] {
        FUNCTIONS
    }

    async fn call(&self, function: &str, args: ToolArgs) -> Result<Value, ToolError> {
        match function {
            "search_techniques" => {
                args.ensure_only(&["keyword"])?;
                Ok(self.search_techniques(args.required_str(&["keyword"])?))
            }
            "get_technique_by_id" => {
                args.ensure_only(&["attack_id", "technique_id"])?;
                Ok(self.get_technique_by_id(args.required_str(&["attack_id", "technique_id"])?))
            }
            "get_mitigations_for_technique" => {
                args.ensure_only(&["attack_id", "technique_id"])?;
                Ok(self.get_mitigations_for_technique(
                    args.required_str(&["attack_id", "technique_id"])?,
                ))
            }
            "get_mitigations_by_keyword" => {
                args.ensure_only(&["keyword"])?;
                Ok(self.get_mitigations_by_keyword(args.required_str(&["keyword"])?))
            }
            "get_techniques_for_mitigation" => {
                args.ensure_only(&["mitigation_id"])?;
                Ok(self.get_techniques_for_mitigation(args.required_str(&["mitigation_id"])?))
            }
            other => Err(unknown_function(MITRE_TOOL_NAME, other)),
        }
    }
}
