use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use common::{ErrorBody, WorkerId};

/// Errores que puede devolver cualquier operación del coordinador.
/// Todos se convierten en una respuesta HTTP; ninguno tumba el proceso.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("parámetro inválido: {0}")]
    Validation(String),

    #[error("token ausente o inválido")]
    Unauthorized,

    #[error("worker bloqueado: {0}")]
    Blocked(WorkerId),

    #[error("worker desconocido: {0}")]
    NotFound(WorkerId),

    #[error("demasiadas requests, reintentar en {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
}

impl CoordinatorError {
    pub fn status(&self) -> StatusCode {
        match self {
            CoordinatorError::Validation(_) => StatusCode::BAD_REQUEST,
            CoordinatorError::Unauthorized => StatusCode::UNAUTHORIZED,
            CoordinatorError::Blocked(_) => StatusCode::FORBIDDEN,
            CoordinatorError::NotFound(_) => StatusCode::NOT_FOUND,
            CoordinatorError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        }
    }
}

impl IntoResponse for CoordinatorError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.to_string(),
        };
        let mut resp = (self.status(), Json(body)).into_response();
        if let CoordinatorError::RateLimited { retry_after_secs } = self {
            resp.headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
        }
        resp
    }
}

// Rechazos de los extractores de axum: body o query mal formados
impl From<JsonRejection> for CoordinatorError {
    fn from(rejection: JsonRejection) -> Self {
        CoordinatorError::Validation(rejection.body_text())
    }
}

impl From<QueryRejection> for CoordinatorError {
    fn from(rejection: QueryRejection) -> Self {
        CoordinatorError::Validation(rejection.body_text())
    }
}
