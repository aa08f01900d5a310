use governance_core::{GovernanceError, HistoryQuery, HistoryRecord, RecordId};

use crate::GovernanceApi;

impl GovernanceApi {
    /// Ledger entries ordered by `resolved_at`, then subject reference.
    ///
    /// # Errors
    /// Returns [`GovernanceError::Validation`] for an inverted time range.
    pub fn list_history(&self, query: &HistoryQuery) -> Result<Vec<HistoryRecord>, GovernanceError> {
        query.validate()?;
        self.read(|store| Ok(store.list_history(query)?))
    }

    /// # Errors
    /// Returns [`GovernanceError::HistoryRecordNotFound`] for unknown ids.
    pub fn get_history_record(&self, record_id: RecordId) -> Result<HistoryRecord, GovernanceError> {
        self.read(|store| {
            Ok(store
                .get_history_record(record_id)?
                .ok_or(GovernanceError::HistoryRecordNotFound(record_id))?)
        })
    }
}
