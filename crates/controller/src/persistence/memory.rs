use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;

use common::api::{NotificationSettings, UpgradePlan, UpgradeReport};

use super::{
    build_plan, channel_plan_key, plan_etag, PlanInput, PlanStore, StoreError,
    DEFAULT_HISTORY_LIMIT,
};

/// In-memory plan store. Contract-identical to the SQLite backend,
/// including the not-found behavior on a plan miss.
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

struct Inner {
    plans: HashMap<String, (UpgradePlan, String)>,
    reports: Vec<UpgradeReport>,
    settings: NotificationSettings,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                plans: HashMap::new(),
                reports: Vec::new(),
                settings: NotificationSettings {
                    notify_on_publish: true,
                    updated_at: Utc::now(),
                },
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PlanStore for MemoryStore {
    async fn fetch_upgrade_plan(
        &self,
        agent_id: &str,
        channel: &str,
    ) -> Result<(UpgradePlan, String), StoreError> {
        let inner = self.inner.lock().expect("plan store poisoned");
        if let Some((plan, etag)) = inner.plans.get(agent_id) {
            return Ok((plan.clone(), etag.clone()));
        }
        if let Some((plan, etag)) = inner.plans.get(&channel_plan_key(channel)) {
            return Ok((plan.clone(), etag.clone()));
        }
        Err(StoreError::PlanNotFound)
    }

    async fn upsert_upgrade_plan(
        &self,
        input: PlanInput,
    ) -> Result<(UpgradePlan, String), StoreError> {
        let plan = build_plan(&input)?;
        let mut inner = self.inner.lock().expect("plan store poisoned");
        let etag = plan_etag(&plan);
        inner
            .plans
            .insert(plan.agent_id.clone(), (plan.clone(), etag.clone()));
        Ok((plan, etag))
    }

    async fn record_upgrade_report(&self, report: UpgradeReport) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("plan store poisoned");
        inner.reports.push(report);
        Ok(())
    }

    async fn list_upgrade_history(
        &self,
        agent_id: &str,
        limit: i64,
    ) -> Result<Vec<UpgradeReport>, StoreError> {
        let limit = if limit <= 0 {
            DEFAULT_HISTORY_LIMIT
        } else {
            limit
        } as usize;
        let inner = self.inner.lock().expect("plan store poisoned");
        let mut reports: Vec<UpgradeReport> = inner
            .reports
            .iter()
            .filter(|r| r.agent_id == agent_id)
            .cloned()
            .collect();
        reports.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        reports.truncate(limit);
        Ok(reports)
    }

    async fn get_notification_settings(&self) -> Result<NotificationSettings, StoreError> {
        let inner = self.inner.lock().expect("plan store poisoned");
        Ok(inner.settings.clone())
    }

    async fn update_notification_settings(
        &self,
        notify: bool,
    ) -> Result<NotificationSettings, StoreError> {
        let mut inner = self.inner.lock().expect("plan store poisoned");
        inner.settings = NotificationSettings {
            notify_on_publish: notify,
            updated_at: Utc::now(),
        };
        Ok(inner.settings.clone())
    }
}
