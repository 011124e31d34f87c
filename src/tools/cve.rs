use async_trait::async_trait;
use serde_json::{Value, json};

use crate::tools::{CVE_TOOL_NAME, FunctionSpec, Tool, ToolArgs, ToolError, unknown_function};

pub const DEFAULT_NVD_BASE_URL: &str = "https://services.nvd.nist.gov/rest/json/cves/2.0";
const DEFAULT_SEARCH_LIMIT: u64 = 10;
const PATCH_URL_KEYWORDS: [&str; 3] = ["patch", "update", "fix"];

const FUNCTIONS: &[FunctionSpec] = &[
    FunctionSpec::new(
        "search_cves",
        &["keyword", "limit"],
        "search CVEs by keyword such as a product name or vulnerability type",
    ),
    FunctionSpec::new(
        "get_cve_details",
        &["cve_id"],
        "full NVD record for one CVE id",
    ),
    FunctionSpec::new(
        "get_related_exploits",
        &["cve_id"],
        "exploit references for one CVE id",
    ),
    FunctionSpec::new(
        "get_patch_info",
        &["cve_id"],
        "patch or vendor advisory links for one CVE id",
    ),
];

/// NVD CVE API 2.0 client.
pub struct CveTool {
    http: reqwest::Client,
    base_url: String,
}

impl CveTool {
    pub fn new(http: reqwest::Client, base_url: String) -> Self {
        Self { http, base_url }
    }

    async fn query(&self, params: &[(&str, String)]) -> Result<Vec<Value>, ToolError> {
        let response = self.http.get(&self.base_url).query(params).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ToolError::Upstream(format!("NVD returned HTTP {status}")));
        }
        let body = response.json::<Value>().await?;
        Ok(body
            .get("vulnerabilities")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    async fn search_cves(&self, keyword: &str, limit: u64) -> Result<Value, ToolError> {
        let vulnerabilities = self
            .query(&[
                ("keywordSearch", keyword.to_string()),
                ("resultsPerPage", limit.to_string()),
            ])
            .await?;
        Ok(Value::Array(vulnerabilities))
    }

    async fn get_cve_details(&self, cve_id: &str) -> Result<Option<Value>, ToolError> {
        let vulnerabilities = self.query(&[("cveId", cve_id.to_string())]).await?;
        Ok(vulnerabilities.into_iter().next())
    }

    async fn get_patch_info(&self, cve_id: &str) -> Result<Value, ToolError> {
        let Some(details) = self.get_cve_details(cve_id).await? else {
            return Ok(json!({ "patches": [], "message": "CVE details not found." }));
        };
        let references = details
            .pointer("/cve/references")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let patches = extract_patch_urls(references);
        let message = if patches.is_empty() {
            "No valid patch URLs found. Please check the vendor's official site for updates."
        } else {
            ""
        };
        Ok(json!({ "patches": patches, "message": message }))
    }
}

pub fn related_exploits(cve_id: &str) -> Value {
    json!([{
        "cve": cve_id,
        "source": "Exploit-DB",
        "url": format!("https://www.exploit-db.com/search?cve={cve_id}"),
    }])
}

/// References tagged `Patch` win; otherwise fall back to URLs that look like
/// patches. Broken links and non-http URLs never count.
pub fn extract_patch_urls(references: &[Value]) -> Vec<String> {
    let usable = references
        .iter()
        .filter_map(|reference| {
            let url = reference.get("url").and_then(Value::as_str)?;
            let tags = reference
                .get("tags")
                .and_then(Value::as_array)
                .map(|tags| {
                    tags.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_ascii_lowercase)
                        .collect::<Vec<String>>()
                })
                .unwrap_or_default();
            if !url.starts_with("http") || tags.iter().any(|tag| tag == "broken link") {
                return None;
            }
            Some((url, tags))
        })
        .collect::<Vec<(&str, Vec<String>)>>();

    let tagged = usable
        .iter()
        .filter(|(_, tags)| tags.iter().any(|tag| tag == "patch"))
        .map(|(url, _)| url.to_string())
        .collect::<Vec<String>>();
    if !tagged.is_empty() {
        return tagged;
    }

    usable
        .iter()
        .filter(|(url, _)| {
            let lowered = url.to_ascii_lowercase();
            PATCH_URL_KEYWORDS
                .iter()
                .any(|keyword| lowered.contains(keyword))
        })
        .map(|(url, _)| url.to_string())
        .collect()
}

#[async_trait]
impl Tool for CveTool {
    fn name(&self) -> &str {
        CVE_TOOL_NAME
    }

    fn description(&self) -> &str {
        "National Vulnerability Database lookups"
    }

    fn functions(&self) -> &[FunctionSpec] {
        FUNCTIONS
    }

    async fn call(&self, function: &str, args: ToolArgs) -> Result<Value, ToolError> {
        match function {
            "search_cves" => {
                args.ensure_only(&["keyword", "limit"])?;
                let keyword = args.required_str(&["keyword"])?;
                let limit = args.optional_u64("limit")?.unwrap_or(DEFAULT_SEARCH_LIMIT);
                self.search_cves(keyword, limit).await
            }
            "get_cve_details" => {
                args.ensure_only(&["cve_id"])?;
                let cve_id = args.required_str(&["cve_id"])?;
                Ok(self.get_cve_details(cve_id).await?.unwrap_or(Value::Null))
            }
            "get_related_exploits" => {
                args.ensure_only(&["cve_id"])?;
                Ok(related_exploits(args.required_str(&["cve_id"])?))
            }
            "get_patch_info" => {
                args.ensure_only(&["cve_id"])?;
                self.get_patch_info(args.required_str(&["cve_id"])?).await
            }
            other => Err(unknown_function(CVE_TOOL_NAME, other)),
        }
    }
}
