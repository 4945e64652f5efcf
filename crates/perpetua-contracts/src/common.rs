// Common response envelopes

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Generic list response wrapper
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ListResponse<T> {
    pub data: Vec<T>,
}

impl<T> ListResponse<T> {
    pub fn new(data: Vec<T>) -> Self {
        Self { data }
    }
}
