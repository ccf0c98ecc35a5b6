use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration for staging and dispatching uploads
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Maximum accepted file size in bytes (default: 50 MB)
    pub max_file_size: usize,

    /// Directory where uploads are staged while an operation runs
    pub temp_dir: PathBuf,

    /// Upper bound for a single operation, including the wait for a permit (default: 120s)
    pub operation_timeout: Duration,

    /// Number of operations allowed to run at the same time (default: 4)
    pub max_concurrent_operations: usize,

    /// LibreOffice binary used by the office-to-PDF operations
    pub soffice_bin: String,

    /// Ghostscript binary used by the compress and pdf2jpg operations
    pub ghostscript_bin: String,

    /// qpdf binary used by the protect and unlock operations
    pub qpdf_bin: String,

    /// Allowed CORS origins (comma separated, "*" for any)
    pub allowed_origins: Vec<String>,

    /// Serve Swagger UI and the OpenAPI document (default: false)
    pub enable_api_docs: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_file_size: 50 * 1024 * 1024, // 50 MB
            temp_dir: env::temp_dir().join("doc-ops-uploads"),
            operation_timeout: Duration::from_secs(120),
            max_concurrent_operations: 4,
            soffice_bin: "soffice".to_string(),
            ghostscript_bin: "gs".to_string(),
            qpdf_bin: "qpdf".to_string(),
            allowed_origins: vec!["*".to_string()],
            enable_api_docs: false,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            max_file_size: env::var("MAX_FILE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_file_size),

            temp_dir: env::var("UPLOAD_TEMP_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(default.temp_dir),

            operation_timeout: env::var("OPERATION_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.operation_timeout),

            max_concurrent_operations: env::var("MAX_CONCURRENT_OPERATIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(default.max_concurrent_operations),

            soffice_bin: env::var("SOFFICE_BIN").unwrap_or(default.soffice_bin),

            ghostscript_bin: env::var("GHOSTSCRIPT_BIN").unwrap_or(default.ghostscript_bin),

            qpdf_bin: env::var("QPDF_BIN").unwrap_or(default.qpdf_bin),

            allowed_origins: env::var("ALLOWED_ORIGINS")
                .ok()
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect::<Vec<_>>()
                })
                .filter(|origins| !origins.is_empty())
                .unwrap_or(default.allowed_origins),

            enable_api_docs: env::var("ENABLE_API_DOCS")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(default.enable_api_docs),
        }
    }

    /// Create config for development (docs enabled, short timeout)
    pub fn development() -> Self {
        Self {
            operation_timeout: Duration::from_secs(30),
            enable_api_docs: true,
            ..Self::default()
        }
    }

    /// Limit applied to the whole request body: the file ceiling plus room
    /// for multipart framing and text fields.
    pub fn request_body_limit(&self) -> usize {
        self.max_file_size.saturating_add(1024 * 1024)
    }

    pub fn allows_any_origin(&self) -> bool {
        self.allowed_origins.iter().any(|o| o == "*")
    }
}
