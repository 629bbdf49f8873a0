use crate::{
    db::{LedgerStore, models::CardKeyLookup},
    tap::CardKeySource,
};

#[async_trait::async_trait]
impl CardKeySource for LedgerStore {
    async fn card_key_lookups(&self) -> Result<Vec<CardKeyLookup>, sqlx::Error> {
        LedgerStore::card_key_lookups(self).await
    }
}
