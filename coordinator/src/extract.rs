//! Extractores que convierten los rechazos de axum en `CoordinatorError`,
//! así todo error sale con el mismo body JSON.

use axum::extract::{FromRequest, FromRequestParts};

use crate::error::CoordinatorError;

#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(CoordinatorError))]
pub struct ValidJson<T>(pub T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(CoordinatorError))]
pub struct ValidQuery<T>(pub T);
