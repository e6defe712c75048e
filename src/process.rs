/// Managed process metadata as reported by `pm2 jlist`.
///
/// Required fields fail the individual record; everything else is optional.
/// Ledger participation is read from the process's launch arguments.
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;

/// Sentinel for processes that do not declare `--netuid`.
pub const NO_SUBNET: i64 = -1;

/// Placeholder for missing version-control metadata.
const NOT_AVAILABLE: &str = "N/A";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagedProcess {
    pub name: String,
    pub interpreter: Option<String>,
    pub args: Vec<String>,
    pub out_log_path: PathBuf,
    pub err_log_path: PathBuf,
    pub status: String,
    pub pm2_home: Option<String>,
    pub venv: Option<String>,
    pub pwd: Option<String>,
    pub git_revision: String,
    pub git_comment: String,
    pub git_branch: String,
    pub git_repo_path: String,
    pub netuid: i64,
    pub subtensor_network: String,
    pub chain_endpoint: String,
    pub coldkey_name: String,
    pub hotkey_name: String,
    pub wallet_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessParseError {
    #[error("process record missing required field `{0}`")]
    MissingField(&'static str),
}

impl ManagedProcess {
    /// Parse one element of the `pm2 jlist` array.
    pub fn from_pm2_record(record: &Value) -> Result<Self, ProcessParseError> {
        let name = required_str(record.get("name"), "name")?;
        let env = record
            .get("pm2_env")
            .ok_or(ProcessParseError::MissingField("pm2_env"))?;

        let out_log_path = required_str(env.get("pm_out_log_path"), "pm_out_log_path")?;
        let err_log_path = required_str(env.get("pm_err_log_path"), "pm_err_log_path")?;
        let status = required_str(env.get("status"), "status")?;

        let args = parse_args(env.get("args"));
        let process_env = env.get("env");
        let env_var = |key: &str| {
            process_env
                .and_then(|e| e.get(key))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        let versioning = env.get("versioning").filter(|v| !v.is_null());
        let git_field = |key: &str| {
            versioning
                .and_then(|v| v.get(key))
                .and_then(Value::as_str)
                .unwrap_or(NOT_AVAILABLE)
                .to_string()
        };

        let netuid = flag_value(&args, "--netuid")
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(NO_SUBNET);
        let flag_string = |flag: &str| flag_value(&args, flag).unwrap_or_default().to_string();

        Ok(Self {
            name,
            interpreter: env
                .get("exec_interpreter")
                .and_then(Value::as_str)
                .map(str::to_string),
            out_log_path: PathBuf::from(out_log_path),
            err_log_path: PathBuf::from(err_log_path),
            status,
            pm2_home: env_var("PM2_HOME"),
            venv: env_var("VIRTUAL_ENV"),
            pwd: env_var("PWD"),
            git_revision: git_field("revision"),
            git_comment: git_field("comment"),
            git_branch: git_field("branch"),
            git_repo_path: git_field("repo_path"),
            netuid,
            subtensor_network: flag_string("--subtensor.network"),
            chain_endpoint: flag_string("--subtensor.chain_endpoint"),
            coldkey_name: flag_string("--wallet.name"),
            hotkey_name: flag_string("--wallet.hotkey"),
            wallet_path: flag_string("--wallet.path"),
            args,
        })
    }

    /// Subnet id if this process participates in the ledger.
    pub fn subnet(&self) -> Option<u16> {
        if self.netuid > 0 {
            u16::try_from(self.netuid).ok()
        } else {
            None
        }
    }

    pub fn is_online(&self) -> bool {
        self.status == "online"
    }
}

fn required_str(value: Option<&Value>, field: &'static str) -> Result<String, ProcessParseError> {
    value
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(ProcessParseError::MissingField(field))
}

/// pm2 stores `args` either as an array or as one whitespace-separated string.
fn parse_args(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        Some(Value::String(s)) => s.split_whitespace().map(str::to_string).collect(),
        _ => Vec::new(),
    }
}

/// Token immediately following the first occurrence of `flag`.
fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    let index = args.iter().position(|arg| arg == flag)?;
    args.get(index + 1).map(String::as_str)
}
