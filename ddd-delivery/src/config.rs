//! 投递配置（DeliveryConfig）
//!
//! 以显式结构体在构造 `Delivery` 时传入，不依赖任何全局环境设置。
//! 支持 serde 反序列化（缺省字段取默认值），便于从配置文件装载。
//!
use crate::error::{DeliveryError, DeliveryResult};
use chrono::TimeDelta;
use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_PAGE_SIZE: usize = 500;
pub const DEFAULT_CATCH_UP_PAGE_SIZE: usize = 500;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// 单个投递阶段最多读取的消息数
    pub page_size: usize,
    /// 追赶时每页读取的历史事件数
    pub catch_up_page_size: usize,
    /// 已投递消息的保留时长；为零时投递后立即删除
    pub dedup_window: Duration,
    /// 租约在未续期的情况下保持有效的时长
    pub lease_liveness: Duration,
    /// 工作节点之间允许的时钟偏差，叠加在 `lease_liveness` 之上
    pub clock_skew_tolerance: Duration,
    /// 同一页内并发投递的目标数（同一目标始终串行）
    pub target_concurrency: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            catch_up_page_size: DEFAULT_CATCH_UP_PAGE_SIZE,
            dedup_window: Duration::ZERO,
            lease_liveness: Duration::from_secs(60),
            clock_skew_tolerance: Duration::from_secs(5),
            target_concurrency: 8,
        }
    }
}

impl DeliveryConfig {
    pub fn validate(&self) -> DeliveryResult<()> {
        if self.page_size == 0 {
            return Err(DeliveryError::invalid_config("page_size must be positive"));
        }
        if self.catch_up_page_size == 0 {
            return Err(DeliveryError::invalid_config(
                "catch_up_page_size must be positive",
            ));
        }
        if self.target_concurrency == 0 {
            return Err(DeliveryError::invalid_config(
                "target_concurrency must be positive",
            ));
        }
        if self.lease_liveness.is_zero() {
            return Err(DeliveryError::invalid_config(
                "lease_liveness must be positive",
            ));
        }
        for (name, value) in [
            ("dedup_window", self.dedup_window),
            ("lease_liveness", self.lease_liveness),
            ("clock_skew_tolerance", self.clock_skew_tolerance),
        ] {
            if TimeDelta::from_std(value).is_err() {
                return Err(DeliveryError::invalid_config(format!(
                    "{name} is out of range"
                )));
            }
        }
        Ok(())
    }

    /// 租约被视为过期所需的静默时长：存活阈值 + 时钟偏差预算
    pub fn lease_expiry(&self) -> TimeDelta {
        to_delta(self.lease_liveness)
            .checked_add(&to_delta(self.clock_skew_tolerance))
            .unwrap_or(TimeDelta::MAX)
    }

    pub fn dedup_window_delta(&self) -> TimeDelta {
        to_delta(self.dedup_window)
    }
}

fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = DeliveryConfig::default();
        assert_eq!(cfg.page_size, 500);
        assert_eq!(cfg.catch_up_page_size, 500);
        assert!(cfg.dedup_window.is_zero());
        assert_eq!(cfg.lease_expiry(), TimeDelta::seconds(65));
        cfg.validate().unwrap();
    }

    #[test]
    fn zero_sizes_are_rejected() {
        for cfg in [
            DeliveryConfig {
                page_size: 0,
                ..Default::default()
            },
            DeliveryConfig {
                catch_up_page_size: 0,
                ..Default::default()
            },
            DeliveryConfig {
                target_concurrency: 0,
                ..Default::default()
            },
            DeliveryConfig {
                lease_liveness: Duration::ZERO,
                ..Default::default()
            },
        ] {
            match cfg.validate() {
                Err(DeliveryError::InvalidConfig { .. }) => {}
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let cfg: DeliveryConfig = serde_json::from_value(serde_json::json!({
            "page_size": 50,
            "dedup_window": { "secs": 30, "nanos": 0 }
        }))
        .unwrap();
        assert_eq!(cfg.page_size, 50);
        assert_eq!(cfg.dedup_window, Duration::from_secs(30));
        assert_eq!(cfg.catch_up_page_size, DEFAULT_CATCH_UP_PAGE_SIZE);
    }
}
