// Participant identity resolution into the session-lifetime cache.

use crate::state::{IdentityRecord, UserId};
use crate::updates::{CoreMsg, InternalEvent};

use super::ChatCore;

impl ChatCore {
    /// Spawn concurrent lookups for `user_ids` (already diffed against the
    /// cache by the caller). A failed or empty lookup degrades to the
    /// fallback record for that id only; the batch as a whole always
    /// completes and reports back.
    pub(super) fn spawn_identity_resolution(
        &mut self,
        user_ids: Vec<UserId>,
        publish_token: Option<u64>,
    ) {
        let Some(sess) = self.session.as_ref() else {
            return;
        };
        let me = sess.user_id.clone();
        let session_epoch = self.conv_epoch;
        let backend = self.backend.clone();
        let tx = self.core_sender.clone();

        self.runtime.spawn(async move {
            let mut lookups = tokio::task::JoinSet::new();
            for user_id in user_ids {
                let backend = backend.clone();
                let me = me.clone();
                lookups.spawn(async move {
                    match backend.get_user_details(&user_id).await {
                        Ok(Some(record)) => record,
                        Ok(None) => IdentityRecord::fallback(&user_id, user_id == me),
                        Err(e) => {
                            tracing::debug!(user_id = %user_id, %e, "identity lookup failed; using fallback");
                            IdentityRecord::fallback(&user_id, user_id == me)
                        }
                    }
                });
            }

            let mut records = Vec::new();
            while let Some(res) = lookups.join_next().await {
                match res {
                    Ok(record) => records.push(record),
                    Err(e) => tracing::warn!(%e, "identity lookup task failed"),
                }
            }

            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::IdentitiesResolved {
                session_epoch,
                publish_token,
                records,
            })));
        });
    }

    /// Additive merge; existing entries are refreshed, never removed, so a
    /// resolved name never regresses to a fallback within the session.
    pub(super) fn merge_identities(&mut self, records: Vec<IdentityRecord>) {
        for record in records {
            self.state.identities.insert(record.user_id.clone(), record);
        }
    }
}
