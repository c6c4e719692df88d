use std::net::SocketAddr;

use async_trait::async_trait;
use axum::{
    http::{header, request::Parts, StatusCode},
    response::IntoResponse,
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tracing::debug;

use crate::config::{JwtConfig, PluginSpec};
use crate::error::Result;

use super::{Plugin, PluginAction};

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    #[allow(dead_code)]
    sub: String,
    #[allow(dead_code)]
    exp: usize,
}

/// Chain plugin validating `Authorization: Bearer <jwt>` against the
/// configured secret. Token issuance lives elsewhere; only validation
/// happens at the gateway.
pub struct AuthPlugin {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl AuthPlugin {
    pub fn new(config: &JwtConfig) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(config.secret_key.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// 401 with a `WWW-Authenticate` challenge, for the missing-header case.
    fn challenge(message: &str) -> PluginAction {
        PluginAction::Halt(
            (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Bearer")],
                message.to_string(),
            )
                .into_response(),
        )
    }

    fn unauthorized(message: &str) -> PluginAction {
        PluginAction::Halt((StatusCode::UNAUTHORIZED, message.to_string()).into_response())
    }
}

#[async_trait]
impl Plugin for AuthPlugin {
    fn name(&self) -> &'static str {
        "auth"
    }

    async fn execute(
        &self,
        parts: &Parts,
        _peer: SocketAddr,
        _spec: &PluginSpec,
    ) -> Result<PluginAction> {
        let header_value = match parts.headers.get(header::AUTHORIZATION) {
            Some(value) => value,
            None => return Ok(Self::challenge("Authorization header required")),
        };
        let header_value = match header_value.to_str() {
            Ok(value) => value,
            Err(_) => return Ok(Self::unauthorized("Invalid Authorization header")),
        };

        let mut parts = header_value.split_whitespace();
        let token = match (parts.next(), parts.next(), parts.next()) {
            (Some(scheme), Some(token), None) if scheme.eq_ignore_ascii_case("bearer") => token,
            _ => {
                return Ok(Self::unauthorized(
                    "Invalid Authorization header format (expected \"Bearer <token>\")",
                ))
            }
        };

        match jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &self.validation) {
            Ok(_) => Ok(PluginAction::Continue),
            Err(error) => {
                debug!(%error, "JWT validation failed");
                Ok(Self::unauthorized("Invalid token"))
            }
        }
    }
}
