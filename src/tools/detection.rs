use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::tools::{DETECTION_TOOL_NAME, FunctionSpec, Tool, ToolArgs, ToolError, unknown_function};

pub const VIRUSTOTAL_BASE_URL: &str = "https://www.virustotal.com/api/v3";
const STAT_KEYS: [&str; 5] = ["harmless", "malicious", "suspicious", "undetected", "timeout"];

const FUNCTIONS: &[FunctionSpec] = &[
    FunctionSpec::new("detect_url", &["url"], "scan a URL with VirusTotal"),
    FunctionSpec::new(
        "detect_file",
        &["file_path"],
        "scan a file from the upload directory with VirusTotal",
    ),
];

/// VirusTotal v3 URL and file scanning.
pub struct DetectionTool {
    http: reqwest::Client,
    api_key: Option<String>,
    upload_dir: PathBuf,
    base_url: String,
}

impl DetectionTool {
    pub fn new(http: reqwest::Client, api_key: Option<String>, upload_dir: PathBuf) -> Self {
        if api_key.is_none() {
            tracing::warn!("VIRUSTOTAL_API_KEY not set; detection calls will fail");
        }
        Self {
            http,
            api_key,
            upload_dir,
            base_url: VIRUSTOTAL_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn api_key(&self) -> Result<&str, ToolError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ToolError::Unavailable("VIRUSTOTAL_API_KEY is not set".to_string()))
    }

    pub async fn detect_url(&self, url: &str) -> Result<Value, ToolError> {
        let api_key = self.api_key()?;
        let response = self
            .http
            .post(format!("{}/urls", self.base_url))
            .header("x-apikey", api_key)
            .form(&[("url", url)])
            .send()
            .await?;
        let submitted = expect_success(response, "URL submission").await?;
        self.fetch_analysis(api_key, &submitted).await
    }

    pub async fn detect_file(&self, file_ref: &str) -> Result<Value, ToolError> {
        let api_key = self.api_key()?;
        let (file_name, bytes) = self.load_file(file_ref).await?;
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("application/octet-stream")?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .http
            .post(format!("{}/files", self.base_url))
            .header("x-apikey", api_key)
            .header("accept", "application/json")
            .multipart(form)
            .send()
            .await?;
        let submitted = expect_success(response, "file upload").await?;
        self.fetch_analysis(api_key, &submitted).await
    }

    async fn fetch_analysis(&self, api_key: &str, submitted: &Value) -> Result<Value, ToolError> {
        let analysis_id = submitted
            .pointer("/data/id")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::Upstream("VirusTotal response missing data.id".to_string()))?;
        let response = self
            .http
            .get(format!("{}/analyses/{analysis_id}", self.base_url))
            .header("x-apikey", api_key)
            .send()
            .await?;
        let analysis = expect_success(response, "analysis fetch").await?;
        Ok(summarize_analysis(&analysis))
    }

    /// Only files already in the upload directory are scanned. URL-shaped
    /// references are never fetched; their final path segment names the upload.
    async fn load_file(&self, file_ref: &str) -> Result<(String, Vec<u8>), ToolError> {
        let path = resolve_upload_path(&self.upload_dir, file_ref)?;
        let bytes = tokio::fs::read(&path).await.map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => {
                ToolError::NotFound(format!("uploaded file '{file_ref}'"))
            }
            _ => ToolError::Io(err),
        })?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.bin".to_string());
        Ok((name, bytes))
    }
}

pub fn resolve_upload_path(upload_dir: &Path, file_ref: &str) -> Result<PathBuf, ToolError> {
    let trimmed = file_ref.trim();
    let without_query = trimmed
        .split(['?', '#'])
        .next()
        .unwrap_or(trimmed);
    let name = Path::new(without_query)
        .file_name()
        .ok_or_else(|| ToolError::InvalidParams(format!("'{file_ref}' does not name a file")))?;
    Ok(upload_dir.join(name))
}

async fn expect_success(response: reqwest::Response, action: &str) -> Result<Value, ToolError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ToolError::Upstream(format!(
            "VirusTotal {action} returned HTTP {status}: {body}"
        )));
    }
    Ok(response.json::<Value>().await?)
}

pub fn summarize_analysis(analysis: &Value) -> Value {
    let stats = analysis.pointer("/data/attributes/stats");
    let mut summary = serde_json::Map::new();
    for key in STAT_KEYS {
        let count = stats
            .and_then(|stats| stats.get(key))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        summary.insert(key.to_string(), json!(count));
    }
    if let Some(status) = analysis
        .pointer("/data/attributes/status")
        .and_then(Value::as_str)
    {
        summary.insert("status".to_string(), json!(status));
    }
    Value::Object(summary)
}

#[async_trait]
impl Tool for DetectionTool {
    fn name(&self) -> &str {
        DETECTION_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Malicious URL and file detection via VirusTotal"
    }

    fn functions(&self) -> &[FunctionSpec] {
        FUNCTIONS
    }

    async fn call(&self, function: &str, args: ToolArgs) -> Result<Value, ToolError> {
        match function {
            "detect_url" => {
                args.ensure_only(&["url"])?;
                self.detect_url(args.required_str(&["url"])?).await
            }
            "detect_file" => {
                args.ensure_only(&["file_path", "file_url"])?;
                self.detect_file(args.required_str(&["file_path", "file_url"])?)
                    .await
            }
            other => Err(unknown_function(DETECTION_TOOL_NAME, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analysis_summary_defaults_missing_counters_to_zero() {
        let analysis = json!({"data": {"attributes": {
            "status": "completed",
            "stats": {"harmless": 60, "malicious": 2}
        }}});
        assert_eq!(
            summarize_analysis(&analysis),
            json!({
                "harmless": 60, "malicious": 2, "suspicious": 0,
                "undetected": 0, "timeout": 0, "status": "completed"
            })
        );
    }

    #[test]
    fn upload_paths_cannot_escape_the_upload_dir() {
        let dir = Path::new("/srv/uploads");
        assert_eq!(
            resolve_upload_path(dir, "../../etc/passwd").expect("file name resolves"),
            PathBuf::from("/srv/uploads/passwd")
        );
        assert!(resolve_upload_path(dir, "..").is_err());
    }

    #[test]
    fn url_references_resolve_to_their_upload_name() {
        let dir = Path::new("/srv/uploads");
        assert_eq!(
            resolve_upload_path(dir, "https://files.example.com/uploads/sample.exe?sig=abc")
                .expect("file name resolves"),
            PathBuf::from("/srv/uploads/sample.exe")
        );
        assert!(
            resolve_upload_path(dir, "http://169.254.169.254/latest/meta-data")
                .expect("file name resolves")
                .starts_with(dir)
        );
    }

    #[tokio::test]
    async fn detect_file_never_fetches_remote_references() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener binds");
        let addr = listener.local_addr().expect("local addr");
        let uploads = tempfile::tempdir().expect("tempdir");
        let tool = DetectionTool::new(
            reqwest::Client::new(),
            Some("vt-key".to_string()),
            uploads.path().to_path_buf(),
        )
        .with_base_url(format!("http://{addr}/vt"));

        let mut params = serde_json::Map::new();
        params.insert(
            "file_path".to_string(),
            json!(format!("http://{addr}/internal-secret")),
        );
        let err = tool
            .call("detect_file", ToolArgs::new(params))
            .await
            .expect_err("remote reference is not an upload");
        assert!(matches!(err, ToolError::NotFound(_)));

        let accepted =
            tokio::time::timeout(std::time::Duration::from_millis(100), listener.accept()).await;
        assert!(accepted.is_err(), "no request may reach the network");
    }

    #[tokio::test]
    async fn missing_api_key_fails_the_call() {
        let tool = DetectionTool::new(reqwest::Client::new(), None, PathBuf::from("uploads"));
        let mut params = serde_json::Map::new();
        params.insert("url".to_string(), json!("https://example.com"));

        let err = tool
            .call("detect_url", ToolArgs::new(params))
            .await
            .expect_err("no key should fail");
        assert!(matches!(err, ToolError::Unavailable(_)));
    }
}
