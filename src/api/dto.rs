use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

pub const DEFAULT_READINGS_LIMIT: i64 = 100;
pub const MAX_READINGS_LIMIT: i64 = 1000;

/// Body of `POST /control/command`; the server stamps `issued_at`.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CommandRequest {
    pub desired_on: bool,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ReadingsParams {
    /// Number of samples, newest first (1..=1000, default 100).
    pub limit: Option<i64>,
}

impl ReadingsParams {
    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_READINGS_LIMIT).clamp(1, MAX_READINGS_LIMIT)
    }
}
