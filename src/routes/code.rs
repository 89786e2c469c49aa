use actix_web::{HttpResponse, Responder, post, web};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{Authenticated, ErrorResponseWithMessage};
use crate::config::SandboxConfig;
use crate::sandbox::{ProcessRunner, RequestError, RunOutcome, RunRequest};

pub const EXEC_DISABLED_NOTE: &str = "Execution disabled (set ALLOW_CODE_EXEC=true to enable)";

#[derive(Deserialize, Debug, Default)]
pub struct RunCodeRequest {
    pub language: Option<String>,
    pub code: Option<String>,
    pub input: Option<String>,
}

#[derive(Serialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub language: String,
    pub code_lines: usize,
    pub input_bytes: usize,
}

/// Response body; the outcome fields are flattened so mocked and real runs share one schema
#[derive(Serialize, Debug)]
pub struct RunCodeResponse {
    #[serde(flatten)]
    pub outcome: RunOutcome,
    pub mocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<&'static str>,
    pub summary: RunSummary,
}

#[post("/api/code/run")]
pub async fn run_code_handler(
    _auth: Authenticated,
    settings: web::Data<SandboxConfig>,
    runner: web::Data<ProcessRunner>,
    shutdown: web::Data<CancellationToken>,
    body: web::Json<RunCodeRequest>,
) -> impl Responder {
    let RunCodeRequest {
        language,
        code,
        input,
    } = body.into_inner();
    let language = language
        .unwrap_or_else(|| "python".to_string())
        .to_lowercase();
    let code = code.unwrap_or_default();
    let input = input.unwrap_or_default();

    if code.is_empty() {
        return bad_request(RequestError::MissingCode);
    }

    let summary = RunSummary {
        language: language.clone(),
        code_lines: count_lines(&code),
        input_bytes: input.len(),
    };

    if !settings.allow_exec {
        log::debug!("Execution disabled, returning mock run for {language}");
        return HttpResponse::Ok().json(RunCodeResponse {
            outcome: mock_outcome(&language, &code, &input),
            mocked: true,
            notes: Some(EXEC_DISABLED_NOTE),
            summary,
        });
    }

    let request = RunRequest::new(language, code)
        .with_input(input)
        .with_timeout_ms(settings.timeout_ms)
        .with_max_output_bytes(settings.max_output_bytes);

    match runner.execute_with_cancel(request, shutdown.get_ref()).await {
        Ok(outcome) => HttpResponse::Ok().json(RunCodeResponse {
            outcome,
            mocked: false,
            notes: None,
            summary,
        }),
        Err(e) => bad_request(e),
    }
}

fn bad_request(err: RequestError) -> HttpResponse {
    HttpResponse::BadRequest().json(ErrorResponseWithMessage {
        reason: "ERR_INVALID_ARGUMENT",
        code: 1,
        message: err.to_string(),
    })
}

/// Deterministic stand-in used while real execution is switched off
pub fn mock_outcome(language: &str, code: &str, input: &str) -> RunOutcome {
    let stdout = [
        format!("Mock run for {language} (stub)"),
        format!("Echo: {input}"),
        format!("Lines of code: {}", count_lines(code)),
        format!("Checksum: {}", checksum(code)),
    ]
    .join("\n");

    RunOutcome {
        stdout,
        stderr: String::new(),
        exit_code: Some(0),
        timed_out: false,
        duration_ms: 1,
    }
}

/// Sum of UTF-16 code units, mod 1000
fn checksum(code: &str) -> u32 {
    code.encode_utf16()
        .fold(0, |acc, unit| (acc + u32::from(unit)) % 1000)
}

fn count_lines(code: &str) -> usize {
    code.split('\n').count()
}
