use std::future::{Ready, ready};

use actix_web::dev::Payload;
use actix_web::error::InternalError;
use actix_web::http::header;
use actix_web::{FromRequest, HttpRequest, HttpResponse, web};

use super::{ErrorResponse, ErrorResponseWithMessage};
use crate::config::AuthConfig;

/// Extractor that only succeeds for callers presenting a configured bearer token
///
/// Place it before the body extractor so unauthenticated requests are turned
/// away before their payload is parsed.
#[derive(Debug)]
pub struct Authenticated;

impl FromRequest for Authenticated {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(authorize(req))
    }
}

fn authorize(req: &HttpRequest) -> Result<Authenticated, actix_web::Error> {
    let Some(auth) = req.app_data::<web::Data<AuthConfig>>() else {
        log::error!("AuthConfig missing from app data, refusing request");
        let response = HttpResponse::InternalServerError().json(ErrorResponse {
            reason: "ERR_INTERNAL",
            code: 6,
        });
        return Err(InternalError::from_response("auth not configured", response).into());
    };

    if !auth.is_enabled() {
        return Ok(Authenticated);
    }

    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty());

    match token {
        None => Err(unauthorized("Missing token")),
        Some(token) if auth.accepts(token) => Ok(Authenticated),
        Some(_) => {
            log::debug!("Rejected request with unknown bearer token");
            Err(unauthorized("Invalid token"))
        }
    }
}

fn unauthorized(message: &'static str) -> actix_web::Error {
    let response = HttpResponse::Unauthorized().json(ErrorResponseWithMessage {
        reason: "ERR_UNAUTHORIZED",
        code: 7,
        message: message.to_string(),
    });
    InternalError::from_response(message, response).into()
}
