//! PipelineRequest trait - binds a content type to its request payload.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::{ContentType, NewTask, PipelineKind};

/// A typed request payload.
///
/// # Usage
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct ThumbnailRequest {
///     content_id: String,
/// }
///
/// impl PipelineRequest for ThumbnailRequest {
///     const CONTENT_TYPE: &'static str = "publication.thumbnail.v1";
///     const KIND: PipelineKind = PipelineKind::Publication;
///
///     fn content_id(&self) -> &str {
///         &self.content_id
///     }
/// }
/// ```
///
/// # Naming
/// - `{pipeline}.{content}.v{major}`
pub trait PipelineRequest: Serialize + DeserializeOwned + Send + Sync + 'static {
    const CONTENT_TYPE: &'static str;
    /// The monitor that claims tasks of this content type.
    const KIND: PipelineKind;

    fn content_id(&self) -> &str;

    fn content_type() -> ContentType {
        ContentType::new(Self::CONTENT_TYPE)
    }

    /// Build the `NewTask` that enqueues this request.
    fn to_new_task(&self) -> Result<NewTask, serde_json::Error> {
        Ok(NewTask::new(
            Self::KIND,
            Self::content_type(),
            self.content_id(),
            serde_json::to_value(self)?,
        ))
    }
}
