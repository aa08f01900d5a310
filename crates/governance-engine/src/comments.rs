use governance_core::{
    validate_actor, validate_text, Comment, CommentId, GovernanceError, SuggestionId,
};
use tracing::info;

use crate::lifecycle::load_suggestion;
use crate::GovernanceApi;

impl GovernanceApi {
    /// Appends a comment. Allowed in every state, including after resolution.
    ///
    /// # Errors
    /// Returns [`GovernanceError::SuggestionNotFound`] for unknown ids and
    /// [`GovernanceError::Validation`] for blank or oversized text.
    pub fn post_comment(
        &self,
        suggestion_id: SuggestionId,
        author: &str,
        text: &str,
    ) -> Result<Comment, GovernanceError> {
        validate_actor(author)?;
        validate_text("comment text", text)?;

        let comment = self.write(|tx| {
            load_suggestion(tx, suggestion_id)?;
            let comment = Comment {
                comment_id: CommentId::new(),
                suggestion_id,
                author: author.to_string(),
                text: text.to_string(),
                created_at: self.clock.now(),
            };
            tx.insert_comment(&comment)?;
            Ok(comment)
        })?;

        info!(
            suggestion_id = %suggestion_id,
            comment_id = %comment.comment_id,
            author = %comment.author,
            "comment posted"
        );
        Ok(comment)
    }

    /// Comments in posting order.
    ///
    /// # Errors
    /// Returns [`GovernanceError::SuggestionNotFound`] for unknown ids.
    pub fn list_comments(&self, suggestion_id: SuggestionId) -> Result<Vec<Comment>, GovernanceError> {
        self.read(|store| {
            if store.get_suggestion(suggestion_id)?.is_none() {
                return Err(GovernanceError::SuggestionNotFound(suggestion_id).into());
            }
            Ok(store.list_comments(suggestion_id)?)
        })
    }
}
