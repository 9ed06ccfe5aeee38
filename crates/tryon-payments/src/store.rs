//! Payment Storage
//!
//! Persistence seam for payment records, customers and lifetime grants.
//! Terminal transitions go through [`PaymentStore::update_status`], a
//! compare-and-set keyed by gateway order id.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::{PaymentError, Result};
use crate::record::{PaymentRecord, PaymentStatus};

/// Payment storage trait
#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Insert a new record. Fails with `DuplicateRecord` if the gateway
    /// order id is already present.
    async fn insert(&self, record: &PaymentRecord) -> Result<()>;

    /// Get record by gateway order id
    async fn get_by_gateway_order(&self, gateway_order_id: &str) -> Result<Option<PaymentRecord>>;

    /// Set `status = next` only where the current status is `expected`.
    ///
    /// Returns the updated record, or `None` when no row matched (unknown
    /// order, or a concurrent writer got there first).
    async fn update_status(
        &self,
        gateway_order_id: &str,
        expected: PaymentStatus,
        next: PaymentStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<PaymentRecord>>;

    /// All records owned by a user
    async fn list_by_user(&self, user_id: &str) -> Result<Vec<PaymentRecord>>;

    /// Records still `processing` that were created before `created_before`
    async fn list_stale_processing(&self, created_before: DateTime<Utc>) -> Result<Vec<PaymentRecord>>;

    /// Lookup-or-create the customer id for an email
    async fn customer_id_for_email(&self, email: &str) -> Result<String>;

    async fn has_lifetime_grant(&self, user_id: &str) -> Result<bool>;

    async fn grant_lifetime(&self, user_id: &str) -> Result<()>;
}

/// In-memory payment store (for development and tests)
#[derive(Default)]
pub struct MemoryPaymentStore {
    records: RwLock<HashMap<String, PaymentRecord>>,
    customers: RwLock<HashMap<String, String>>,
    lifetime: RwLock<HashSet<String>>,
}

impl MemoryPaymentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[async_trait]
impl PaymentStore for MemoryPaymentStore {
    async fn insert(&self, record: &PaymentRecord) -> Result<()> {
        let mut records = self.records.write().await;

        if records.contains_key(&record.gateway_order_id) {
            return Err(PaymentError::DuplicateRecord(record.gateway_order_id.clone()));
        }

        records.insert(record.gateway_order_id.clone(), record.clone());
        Ok(())
    }

    async fn get_by_gateway_order(&self, gateway_order_id: &str) -> Result<Option<PaymentRecord>> {
        let records = self.records.read().await;
        Ok(records.get(gateway_order_id).cloned())
    }

    async fn update_status(
        &self,
        gateway_order_id: &str,
        expected: PaymentStatus,
        next: PaymentStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<PaymentRecord>> {
        let mut records = self.records.write().await;

        match records.get_mut(gateway_order_id) {
            Some(record) if record.status == expected && expected.can_transition_to(next) => {
                record.status = next;
                record.updated_at = now;
                Ok(Some(record.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<PaymentRecord>> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_stale_processing(&self, created_before: DateTime<Utc>) -> Result<Vec<PaymentRecord>> {
        let records = self.records.read().await;
        let mut stale: Vec<PaymentRecord> = records
            .values()
            .filter(|r| r.status == PaymentStatus::Processing && r.created_at < created_before)
            .cloned()
            .collect();
        stale.sort_by_key(|r| r.created_at);
        Ok(stale)
    }

    async fn customer_id_for_email(&self, email: &str) -> Result<String> {
        let key = normalize_email(email);
        if key.is_empty() {
            return Err(PaymentError::MalformedPayload("customer email is empty".into()));
        }

        let mut customers = self.customers.write().await;
        let id = customers
            .entry(key)
            .or_insert_with(|| format!("cus_{}", uuid::Uuid::new_v4().simple()));
        Ok(id.clone())
    }

    async fn has_lifetime_grant(&self, user_id: &str) -> Result<bool> {
        Ok(self.lifetime.read().await.contains(user_id))
    }

    async fn grant_lifetime(&self, user_id: &str) -> Result<()> {
        self.lifetime.write().await.insert(user_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::record::{Interval, PaymentType};
    use chrono::Duration;

    pub(crate) fn sample_record(user_id: &str, aoid: &str, now: DateTime<Utc>) -> PaymentRecord {
        PaymentRecord {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            customer_id: "cus_test".into(),
            customer_email: "buyer@example.com".into(),
            price_id: "price_tryon_monthly".into(),
            plan_id: "tryon_pro".into(),
            amount: 180,
            currency: "CNY".into(),
            payment_type: PaymentType::Subscription,
            interval: Some(Interval::Month),
            order_no: format!("no_{aoid}"),
            gateway_order_id: aoid.into(),
            status: PaymentStatus::Processing,
            period_start: now,
            period_end: now + Duration::days(30),
            metadata: Default::default(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicate_gateway_order() {
        let store = MemoryPaymentStore::new();
        let now = Utc::now();
        store.insert(&sample_record("u1", "aoid_1", now)).await.unwrap();

        let again = store.insert(&sample_record("u1", "aoid_1", now)).await;
        assert!(matches!(again, Err(PaymentError::DuplicateRecord(_))));
    }

    #[tokio::test]
    async fn test_update_status_is_compare_and_set() {
        let store = MemoryPaymentStore::new();
        let now = Utc::now();
        store.insert(&sample_record("u1", "aoid_1", now)).await.unwrap();

        let first = store
            .update_status("aoid_1", PaymentStatus::Processing, PaymentStatus::Active, now)
            .await
            .unwrap();
        assert_eq!(first.map(|r| r.status), Some(PaymentStatus::Active));

        let second = store
            .update_status("aoid_1", PaymentStatus::Processing, PaymentStatus::Active, now)
            .await
            .unwrap();
        assert!(second.is_none());

        let missing = store
            .update_status("aoid_x", PaymentStatus::Processing, PaymentStatus::Active, now)
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_finalize_updates_once() {
        let store = std::sync::Arc::new(MemoryPaymentStore::new());
        let now = Utc::now();
        store.insert(&sample_record("u1", "aoid_1", now)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update_status("aoid_1", PaymentStatus::Processing, PaymentStatus::Active, now)
                    .await
                    .unwrap()
                    .is_some()
            }));
        }

        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_customer_lookup_is_idempotent() {
        let store = MemoryPaymentStore::new();
        let a = store.customer_id_for_email("Buyer@Example.com").await.unwrap();
        let b = store.customer_id_for_email(" buyer@example.com ").await.unwrap();
        let c = store.customer_id_for_email("other@example.com").await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_stale_processing_excludes_recent_and_settled() {
        let store = MemoryPaymentStore::new();
        let now = Utc::now();
        let old = now - Duration::minutes(30);

        store.insert(&sample_record("u1", "old", old)).await.unwrap();
        store.insert(&sample_record("u1", "new", now)).await.unwrap();
        store.insert(&sample_record("u1", "paid", old)).await.unwrap();
        store
            .update_status("paid", PaymentStatus::Processing, PaymentStatus::Active, now)
            .await
            .unwrap();

        let stale = store
            .list_stale_processing(now - Duration::minutes(10))
            .await
            .unwrap();
        let ids: Vec<_> = stale.iter().map(|r| r.gateway_order_id.as_str()).collect();
        assert_eq!(ids, vec!["old"]);
    }
}
