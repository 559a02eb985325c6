pub mod command;
pub mod stats;
pub mod worker;

pub use command::*;
pub use stats::*;
pub use worker::*;

/// Respuesta genérica de error que devuelve el coordinador.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Respuesta genérica de las operaciones de administración.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AckResponse {
    pub ok: bool,
    pub message: String,
}
