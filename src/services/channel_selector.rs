use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tracing::debug;

use crate::database::channel_store::ChannelStore;
use crate::models::channel::Channel;
use crate::services::ttl_cache::TtlCache;

/// 渠道选择器
///
/// 按 `(group, model)` 缓存可用渠道列表；同一优先级内按权重随机选择。
/// `attempt_index` 决定使用第几个优先级档位（超出时取最低档），
/// 已尝试过的渠道在可行时被排除。
pub struct ChannelSelector {
    store: Arc<dyn ChannelStore>,
    cache: TtlCache<(String, String), Arc<Vec<Channel>>>,
}

impl ChannelSelector {
    pub fn new(store: Arc<dyn ChannelStore>, ttl: Duration) -> Self {
        Self {
            store,
            cache: TtlCache::new(ttl),
        }
    }

    /// 满足分组与模型约束的全部已启用渠道
    pub async fn candidates(&self, group: &str, model: &str) -> Result<Arc<Vec<Channel>>> {
        let key = (group.to_string(), model.to_string());
        if let Some(channels) = self.cache.get(&key) {
            return Ok(channels);
        }

        let channels = Arc::new(self.store.find_channels(group, model).await?);
        // 空结果不缓存，新增渠道可以立即生效
        if !channels.is_empty() {
            self.cache.insert(key, channels.clone());
        }
        Ok(channels)
    }

    /// 选择一个渠道，没有可用渠道时返回 `None`
    pub async fn select(
        &self,
        group: &str,
        model: &str,
        attempt_index: usize,
        tried: &[i64],
    ) -> Result<Option<Channel>> {
        let candidates = self.candidates(group, model).await?;
        let selected = pick_channel(&candidates, attempt_index, tried, &mut rand::thread_rng());
        if let Some(channel) = &selected {
            debug!(
                "选择渠道: group={}, model={}, attempt={}, channel_id={}",
                group, model, attempt_index, channel.id
            );
        }
        Ok(selected)
    }

    /// 清空选择缓存（渠道配置或状态变化后调用）
    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }
}

/// 从候选渠道中按优先级档位与权重挑选
pub fn pick_channel<R: Rng + ?Sized>(
    candidates: &[Channel],
    attempt_index: usize,
    tried: &[i64],
    rng: &mut R,
) -> Option<Channel> {
    let mut priorities: Vec<i64> = candidates.iter().map(|c| c.priority).collect();
    priorities.sort_unstable_by(|a, b| b.cmp(a));
    priorities.dedup();

    let tier_index = attempt_index.min(priorities.len().checked_sub(1)?);
    let tier_priority = priorities[tier_index];

    let in_tier = |untried_only: bool, priority: i64| {
        candidates
            .iter()
            .filter(|c| c.priority == priority)
            .filter(|c| !untried_only || !tried.contains(&c.id))
            .collect::<Vec<&Channel>>()
    };

    // 先在目标档位里找未尝试过的，再依次看其他档位，最后允许复用
    let mut pool = in_tier(true, tier_priority);
    if pool.is_empty() {
        pool = priorities
            .iter()
            .filter(|p| **p != tier_priority)
            .map(|p| in_tier(true, *p))
            .find(|channels| !channels.is_empty())
            .unwrap_or_default();
    }
    if pool.is_empty() {
        pool = in_tier(false, tier_priority);
    }

    weighted_pick(&pool, rng).cloned()
}

fn weighted_pick<'a, R: Rng + ?Sized>(channels: &[&'a Channel], rng: &mut R) -> Option<&'a Channel> {
    if channels.len() <= 1 {
        return channels.first().copied();
    }
    let total: u64 = channels.iter().map(|c| u64::from(c.weight.max(1))).sum();
    let target = rng.gen_range(0..total);
    let mut cumulative = 0u64;
    for channel in channels {
        cumulative += u64::from(channel.weight.max(1));
        if target < cumulative {
            return Some(channel);
        }
    }
    channels.last().copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::channel_store::MockChannelStore;
    use crate::models::channel::test_channel;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;

    fn channel(id: i64, priority: i64, weight: u32) -> Channel {
        let mut c = test_channel(id);
        c.priority = priority;
        c.weight = weight;
        c
    }

    #[test]
    fn attempt_index_walks_priority_tiers() {
        let candidates = vec![channel(1, 10, 1), channel(2, 5, 1), channel(3, 0, 1)];
        let mut rng = rand::thread_rng();
        assert_eq!(pick_channel(&candidates, 0, &[], &mut rng).unwrap().id, 1);
        assert_eq!(pick_channel(&candidates, 1, &[], &mut rng).unwrap().id, 2);
        assert_eq!(pick_channel(&candidates, 2, &[], &mut rng).unwrap().id, 3);
        // 超出档位数时停留在最低档
        assert_eq!(pick_channel(&candidates, 9, &[], &mut rng).unwrap().id, 3);
    }

    #[test]
    fn no_channel_repeats_before_all_tried() {
        let candidates = vec![channel(1, 0, 1), channel(2, 0, 5), channel(3, 0, 100)];
        let mut rng = rand::thread_rng();

        for _ in 0..50 {
            let mut tried = Vec::new();
            for attempt in 0..3 {
                let picked = pick_channel(&candidates, attempt, &tried, &mut rng).unwrap();
                assert!(!tried.contains(&picked.id));
                tried.push(picked.id);
            }
            assert_eq!(tried.iter().collect::<HashSet<_>>().len(), 3);
        }
    }

    #[test]
    fn exhausted_tier_falls_back_to_other_tiers_then_reuse() {
        let candidates = vec![channel(1, 10, 1), channel(2, 5, 1)];
        let mut rng = rand::thread_rng();
        assert_eq!(pick_channel(&candidates, 0, &[1], &mut rng).unwrap().id, 2);
        assert_eq!(pick_channel(&candidates, 0, &[1, 2], &mut rng).unwrap().id, 1);
    }

    #[test]
    fn heavier_channels_win_more_often() {
        let candidates = vec![channel(1, 0, 1), channel(2, 0, 9)];
        let mut rng = rand::thread_rng();
        let heavy = (0..2000)
            .filter(|_| pick_channel(&candidates, 0, &[], &mut rng).unwrap().id == 2)
            .count();
        assert!(heavy > 1500, "heavy channel picked {} times", heavy);
    }

    #[test]
    fn empty_candidates_yield_none() {
        assert!(pick_channel(&[], 0, &[], &mut rand::thread_rng()).is_none());
    }

    #[tokio::test]
    async fn cache_serves_repeat_lookups_until_invalidated() {
        let mut store = MockChannelStore::new();
        store
            .expect_find_channels()
            .times(2)
            .returning(|_, _| Ok(vec![test_channel(7)]));
        let selector = ChannelSelector::new(Arc::new(store), Duration::from_secs(60));

        for _ in 0..3 {
            let picked = selector.select("default", "gpt-4", 0, &[]).await.unwrap();
            assert_eq!(picked.unwrap().id, 7);
        }
        selector.invalidate_all();
        assert!(selector.select("default", "gpt-4", 0, &[]).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn empty_results_are_not_cached() {
        let mut store = MockChannelStore::new();
        store
            .expect_find_channels()
            .times(2)
            .returning(|_, _| Ok(Vec::new()));
        let selector = ChannelSelector::new(Arc::new(store), Duration::from_secs(60));

        assert!(selector.select("default", "x", 0, &[]).await.unwrap().is_none());
        assert!(selector.select("default", "x", 0, &[]).await.unwrap().is_none());
    }
}
