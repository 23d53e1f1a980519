use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use taskpilot_core::{
    config::RiskConfig,
    models::{BudgetDecision, LossEvent, RiskBudget, RiskPeriod},
    traits::StateRepository,
    SchedulerError, SchedulerResult,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const BUDGETS_NAMESPACE: &str = "risk_budgets";
pub const EVENTS_NAMESPACE: &str = "risk_events";
const EVENTS_KEY: &str = "log";

struct BudgetBook {
    budgets: BTreeMap<RiskPeriod, RiskBudget>,
    events: VecDeque<LossEvent>,
}

impl BudgetBook {
    fn budget_mut(&mut self, period: RiskPeriod, now: DateTime<Utc>) -> &mut RiskBudget {
        let budget = self
            .budgets
            .entry(period)
            .or_insert_with(|| RiskBudget::new(period, 0.0, now));
        if budget.roll_over(now) {
            info!("{} 预算进入新周期 {}，已清零并解冻", period, budget.period_key);
        }
        budget
    }
}

/// 周期风险预算管理
///
/// 日、周、月三个预算共用一把锁，亏损记录与冻结判定在同一临界区内完成。
pub struct RiskBudgetManager {
    book: Mutex<BudgetBook>,
    max_events: usize,
    state_repository: Option<Arc<dyn StateRepository>>,
}

impl RiskBudgetManager {
    pub fn new(config: &RiskConfig) -> Self {
        let now = Utc::now();
        let budgets = RiskPeriod::ALL
            .into_iter()
            .map(|period| (period, RiskBudget::new(period, config.limit_for(period), now)))
            .collect();
        Self {
            book: Mutex::new(BudgetBook {
                budgets,
                events: VecDeque::new(),
            }),
            max_events: config.max_events.max(1),
            state_repository: None,
        }
    }

    pub fn with_state_repository(mut self, repository: Arc<dyn StateRepository>) -> Self {
        self.state_repository = Some(repository);
        self
    }

    /// 从状态存储恢复预算与亏损日志
    pub async fn load(&self) -> SchedulerResult<usize> {
        let Some(repository) = &self.state_repository else {
            return Ok(0);
        };
        let mut book = self.book.lock().await;
        let mut restored = 0;

        for (key, value) in repository.load_namespace(BUDGETS_NAMESPACE).await? {
            match serde_json::from_value::<RiskBudget>(value) {
                Ok(budget) => {
                    book.budgets.insert(budget.period, budget);
                    restored += 1;
                }
                Err(e) => warn!("无法解析持久化的预算 {}: {}", key, e),
            }
        }
        if let Some(value) = repository.get(EVENTS_NAMESPACE, EVENTS_KEY).await? {
            book.events = serde_json::from_value(value)?;
        }

        info!("已恢复 {} 个风险预算，{} 条亏损事件", restored, book.events.len());
        Ok(restored)
    }

    pub async fn check_budget(&self, period: RiskPeriod) -> SchedulerResult<BudgetDecision> {
        self.check_budget_at(period, Utc::now()).await
    }

    pub async fn check_budget_at(
        &self,
        period: RiskPeriod,
        now: DateTime<Utc>,
    ) -> SchedulerResult<BudgetDecision> {
        // 周期切换按周期标识判定，持久化的旧周期记录在下次加载时同样会被清零
        let mut book = self.book.lock().await;
        Ok(book.budget_mut(period, now).decision())
    }

    /// 检查所有周期，返回第一个冻结的周期及原因
    pub async fn first_frozen(&self) -> SchedulerResult<Option<(RiskPeriod, String)>> {
        for period in RiskPeriod::ALL {
            if let BudgetDecision::Frozen { reason } = self.check_budget(period).await? {
                return Ok(Some((period, reason)));
            }
        }
        Ok(None)
    }

    pub async fn record_loss(
        &self,
        amount: f64,
        period: RiskPeriod,
    ) -> SchedulerResult<BudgetDecision> {
        self.record_loss_at(amount, period, Utc::now()).await
    }

    /// 记录亏损（取绝对值），超过上限时在同一临界区内冻结
    pub async fn record_loss_at(
        &self,
        amount: f64,
        period: RiskPeriod,
        now: DateTime<Utc>,
    ) -> SchedulerResult<BudgetDecision> {
        validate_amount(amount)?;
        let mut book = self.book.lock().await;
        let budget = book.budget_mut(period, now);
        if budget.add_loss(amount, now) {
            warn!("{} 风险预算已冻结: {:?}", period, budget.freeze_reason);
        }
        let budget = budget.clone();
        let event = LossEvent {
            timestamp: now,
            amount: amount.abs(),
            periods: vec![period],
            tag: None,
            note: None,
        };
        self.push_event(&mut book, event);

        self.persist_budget(&budget).await?;
        self.persist_events(&book).await?;
        Ok(budget.decision())
    }

    /// 对所有周期记录同一笔亏损
    pub async fn record_loss_all(
        &self,
        amount: f64,
        tag: Option<String>,
        note: Option<String>,
    ) -> SchedulerResult<Vec<RiskBudget>> {
        validate_amount(amount)?;
        let now = Utc::now();
        let mut book = self.book.lock().await;

        let mut updated = Vec::with_capacity(RiskPeriod::ALL.len());
        for period in RiskPeriod::ALL {
            let budget = book.budget_mut(period, now);
            if budget.add_loss(amount, now) {
                warn!("{} 风险预算已冻结: {:?}", period, budget.freeze_reason);
            }
            updated.push(budget.clone());
        }
        self.push_event(
            &mut book,
            LossEvent {
                timestamp: now,
                amount: amount.abs(),
                periods: RiskPeriod::ALL.to_vec(),
                tag,
                note,
            },
        );

        for budget in &updated {
            self.persist_budget(budget).await?;
        }
        self.persist_events(&book).await?;
        debug!("记录亏损 {:.2}，影响全部周期", amount.abs());
        Ok(updated)
    }

    /// 调整预算上限，`unfreeze` 为真时同时解冻
    pub async fn update_limit(
        &self,
        period: RiskPeriod,
        limit: f64,
        unfreeze: bool,
    ) -> SchedulerResult<RiskBudget> {
        if !limit.is_finite() || limit < 0.0 {
            return Err(SchedulerError::Validation(format!(
                "预算上限必须是非负数: {limit}"
            )));
        }
        let now = Utc::now();
        let mut book = self.book.lock().await;
        let budget = book.budget_mut(period, now);
        budget.limit = limit;
        budget.updated_at = now;
        if unfreeze {
            budget.frozen = false;
            budget.freeze_reason = None;
        } else if !budget.frozen && limit > 0.0 && budget.consumed > limit {
            budget.frozen = true;
            budget.freeze_reason = Some(format!(
                "{} 预算上限下调至 {:.2}，已用 {:.2}",
                period, limit, budget.consumed
            ));
        }
        let budget = budget.clone();
        info!("{} 预算上限更新为 {:.2} (frozen={})", period, limit, budget.frozen);
        self.persist_budget(&budget).await?;
        Ok(budget)
    }

    /// 人工解冻，已用额度保留
    pub async fn unfreeze(&self, period: RiskPeriod) -> SchedulerResult<RiskBudget> {
        let now = Utc::now();
        let mut book = self.book.lock().await;
        let budget = book.budget_mut(period, now);
        budget.frozen = false;
        budget.freeze_reason = None;
        budget.updated_at = now;
        let budget = budget.clone();
        info!("{} 预算已人工解冻", period);
        self.persist_budget(&budget).await?;
        Ok(budget)
    }

    /// 清零已用额度并解冻
    pub async fn reset_period(&self, period: RiskPeriod) -> SchedulerResult<RiskBudget> {
        let now = Utc::now();
        let mut book = self.book.lock().await;
        let budget = book.budget_mut(period, now);
        budget.reset(now);
        let budget = budget.clone();
        info!("{} 预算已重置", period);
        self.persist_budget(&budget).await?;
        Ok(budget)
    }

    pub async fn budgets(&self) -> Vec<RiskBudget> {
        let now = Utc::now();
        let mut book = self.book.lock().await;
        RiskPeriod::ALL
            .into_iter()
            .map(|period| book.budget_mut(period, now).clone())
            .collect()
    }

    /// 最近的亏损事件，新事件在后
    pub async fn events(&self, limit: usize) -> Vec<LossEvent> {
        let book = self.book.lock().await;
        let skip = book.events.len().saturating_sub(limit);
        book.events.iter().skip(skip).cloned().collect()
    }

    fn push_event(&self, book: &mut BudgetBook, event: LossEvent) {
        book.events.push_back(event);
        while book.events.len() > self.max_events {
            book.events.pop_front();
        }
    }

    async fn persist_budget(&self, budget: &RiskBudget) -> SchedulerResult<()> {
        if let Some(repository) = &self.state_repository {
            repository
                .put(
                    BUDGETS_NAMESPACE,
                    budget.period.as_str(),
                    &serde_json::to_value(budget)?,
                )
                .await?;
        }
        Ok(())
    }

    async fn persist_events(&self, book: &BudgetBook) -> SchedulerResult<()> {
        if let Some(repository) = &self.state_repository {
            repository
                .put(
                    EVENTS_NAMESPACE,
                    EVENTS_KEY,
                    &serde_json::to_value(&book.events)?,
                )
                .await?;
        }
        Ok(())
    }
}

fn validate_amount(amount: f64) -> SchedulerResult<()> {
    if amount.is_finite() {
        Ok(())
    } else {
        Err(SchedulerError::Validation(format!("无效的亏损金额: {amount}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn manager() -> RiskBudgetManager {
        RiskBudgetManager::new(&RiskConfig::default())
    }

    #[tokio::test]
    async fn test_loss_beyond_limit_freezes() {
        let manager = manager();
        let decision = manager.record_loss(600.0, RiskPeriod::Daily).await.unwrap();
        assert!(decision.is_frozen());
        assert!(manager
            .check_budget(RiskPeriod::Daily)
            .await
            .unwrap()
            .is_frozen());
        assert!(!manager
            .check_budget(RiskPeriod::Weekly)
            .await
            .unwrap()
            .is_frozen());
    }

    #[tokio::test]
    async fn test_negative_amounts_count_as_losses() {
        let manager = manager();
        manager.record_loss(-200.0, RiskPeriod::Daily).await.unwrap();
        let decision = manager.record_loss(-350.0, RiskPeriod::Daily).await.unwrap();
        assert!(decision.is_frozen());
        assert!(manager.record_loss(f64::NAN, RiskPeriod::Daily).await.is_err());
    }

    #[tokio::test]
    async fn test_new_period_resets_consumption() {
        let manager = manager();
        let monday = Utc.with_ymd_and_hms(2026, 10, 12, 9, 0, 0).unwrap();
        manager
            .record_loss_at(700.0, RiskPeriod::Daily, monday)
            .await
            .unwrap();
        assert!(manager
            .check_budget_at(RiskPeriod::Daily, monday + Duration::hours(2))
            .await
            .unwrap()
            .is_frozen());

        let tuesday = monday + Duration::days(1);
        let decision = manager
            .check_budget_at(RiskPeriod::Daily, tuesday)
            .await
            .unwrap();
        assert_eq!(decision, BudgetDecision::Ok { remaining: 500.0 });
    }

    #[tokio::test]
    async fn test_operator_actions() {
        let manager = manager();
        manager.record_loss(600.0, RiskPeriod::Daily).await.unwrap();

        let budget = manager.unfreeze(RiskPeriod::Daily).await.unwrap();
        assert!(!budget.frozen);
        assert_eq!(budget.consumed, 600.0);

        let budget = manager
            .update_limit(RiskPeriod::Daily, 400.0, false)
            .await
            .unwrap();
        assert!(budget.frozen);

        let budget = manager
            .update_limit(RiskPeriod::Daily, 1000.0, true)
            .await
            .unwrap();
        assert!(!budget.frozen);
        assert!(manager
            .update_limit(RiskPeriod::Daily, -1.0, true)
            .await
            .is_err());

        let budget = manager.reset_period(RiskPeriod::Daily).await.unwrap();
        assert_eq!(budget.consumed, 0.0);
    }

    #[tokio::test]
    async fn test_zero_limit_never_freezes() {
        let config = RiskConfig {
            weekly_limit: 0.0,
            ..RiskConfig::default()
        };
        let manager = RiskBudgetManager::new(&config);
        let decision = manager
            .record_loss(1_000_000.0, RiskPeriod::Weekly)
            .await
            .unwrap();
        assert!(!decision.is_frozen());
    }

    #[tokio::test]
    async fn test_record_loss_all_keeps_bounded_log() {
        let config = RiskConfig {
            max_events: 2,
            ..RiskConfig::default()
        };
        let manager = RiskBudgetManager::new(&config);
        for i in 0..3 {
            manager
                .record_loss_all(100.0, Some(format!("trade-{i}")), None)
                .await
                .unwrap();
        }

        let budgets = manager.budgets().await;
        assert!(budgets.iter().all(|b| b.consumed == 300.0));
        let events = manager.events(10).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].tag.as_deref(), Some("trade-2"));
        assert_eq!(events[0].periods.len(), 3);
    }
}
