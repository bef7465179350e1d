use crate::api::ApiError;
use crate::auth::AuthMode;

/// Free-tier offsets advance in steps of this size.
pub const OFFSET_STEP: u32 = 5;

/// Largest page a PRO request may ask for.
pub const MAX_PAGE_SIZE: u32 = 50;

pub const DEFAULT_PAGE_SIZE: u32 = 10;

/// Pagination parameters for a workout fetch. The variant must match the
/// client's authentication mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkoutQuery {
    /// Bearer sessions page by offset over one user's history.
    Offset { offset: u32, username: String },
    /// API-key sessions page by page number.
    Page { page: u32, page_size: u32 },
}

impl WorkoutQuery {
    pub fn offset(offset: u32, username: impl Into<String>) -> Self {
        WorkoutQuery::Offset {
            offset,
            username: username.into(),
        }
    }

    pub fn page(page: u32, page_size: u32) -> Self {
        WorkoutQuery::Page { page, page_size }
    }

    /// Check the parameters against their bounds and against the mode they
    /// will be sent with.
    pub fn validate_for(&self, mode: &AuthMode) -> Result<(), ApiError> {
        match (self, mode) {
            (WorkoutQuery::Offset { offset, username }, AuthMode::BearerSession { .. }) => {
                if username.trim().is_empty() {
                    return Err(ApiError::InvalidRequest(
                        "username is required for bearer sessions".into(),
                    ));
                }
                if offset % OFFSET_STEP != 0 {
                    return Err(ApiError::InvalidRequest(format!(
                        "offset must be a multiple of {}, got {}",
                        OFFSET_STEP, offset
                    )));
                }
                Ok(())
            }
            (WorkoutQuery::Page { page, page_size }, AuthMode::ApiKeySession { .. }) => {
                if *page < 1 {
                    return Err(ApiError::InvalidRequest("page starts at 1".into()));
                }
                if !(1..=MAX_PAGE_SIZE).contains(page_size) {
                    return Err(ApiError::InvalidRequest(format!(
                        "page_size must be between 1 and {}, got {}",
                        MAX_PAGE_SIZE, page_size
                    )));
                }
                Ok(())
            }
            (_, AuthMode::Unauthenticated) => Err(ApiError::MissingCredentials),
            (WorkoutQuery::Offset { .. }, AuthMode::ApiKeySession { .. }) => Err(
                ApiError::InvalidRequest("API-key sessions paginate by page, not offset".into()),
            ),
            (WorkoutQuery::Page { .. }, AuthMode::BearerSession { .. }) => Err(
                ApiError::InvalidRequest("bearer sessions paginate by offset, not page".into()),
            ),
        }
    }
}
