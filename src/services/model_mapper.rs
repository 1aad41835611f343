use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tracing::{info, warn};

use crate::database::option_store::{OptionStore, GLOBAL_MODEL_MAPPING_KEY};
use crate::models::model_mapping::{validate_model_mapping, GlobalModelMapping, MappingError};

/// 同优先级多模型时的轮询游标
#[derive(Debug, Default)]
pub struct RoundRobinCounter {
    cursors: HashMap<String, usize>,
}

impl RoundRobinCounter {
    /// 返回当前位置并前进一格（对 `len` 取模）
    pub fn next(&mut self, key: &str, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        let cursor = self.cursors.entry(key.to_string()).or_insert(0);
        let current = *cursor % len;
        *cursor = (current + 1) % len;
        current
    }

    pub fn reset(&mut self) {
        self.cursors.clear();
    }
}

/// 虚拟模型映射服务
///
/// 映射表整体替换（写时复制），读路径只在读锁内克隆一个 `Arc`；
/// 轮询游标有独立的锁，配置变化时清零。
pub struct ModelMappingService {
    store: Arc<dyn OptionStore>,
    mapping: RwLock<Arc<GlobalModelMapping>>,
    counter: Mutex<RoundRobinCounter>,
    /// 串行化写操作，保证持久化顺序与内存中的替换顺序一致
    write_lock: tokio::sync::Mutex<()>,
}

impl ModelMappingService {
    pub fn new(store: Arc<dyn OptionStore>) -> Self {
        Self {
            store,
            mapping: RwLock::new(Arc::new(GlobalModelMapping::empty())),
            counter: Mutex::new(RoundRobinCounter::default()),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// 启动时从配置表加载
    pub async fn load(&self) -> Result<(), MappingError> {
        let _guard = self.write_lock.lock().await;
        let mapping = self.read_from_store().await?;
        info!(
            "加载全局模型映射: {} 个虚拟模型",
            mapping.virtual_models().len()
        );
        self.swap(mapping);
        Ok(())
    }

    /// 将虚拟模型解析为实际模型，没有映射时原样返回
    pub fn resolve(&self, virtual_model: &str) -> String {
        let mapping = self.snapshot();
        let Some(items) = mapping.items(virtual_model) else {
            return virtual_model.to_string();
        };

        // 负优先级在写入时已被拒绝，这里仍然跳过
        let Some(max_priority) = items
            .iter()
            .filter(|item| item.priority >= 0)
            .map(|item| item.priority)
            .max()
        else {
            return virtual_model.to_string();
        };

        let top: Vec<&str> = items
            .iter()
            .filter(|item| item.priority == max_priority)
            .map(|item| item.model.as_str())
            .collect();

        if top.len() == 1 {
            return top[0].to_string();
        }

        let index = self
            .counter
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .next(virtual_model, top.len());
        top[index].to_string()
    }

    /// 校验、持久化并整体替换映射表
    pub async fn update(&self, mapping: GlobalModelMapping) -> Result<(), MappingError> {
        validate_model_mapping(&mapping)?;
        let raw = serde_json::to_string(&mapping)?;

        let _guard = self.write_lock.lock().await;
        self.store.set_option(GLOBAL_MODEL_MAPPING_KEY, &raw).await?;
        info!(
            "更新全局模型映射: {} 个虚拟模型",
            mapping.virtual_models().len()
        );
        self.swap(mapping);
        Ok(())
    }

    /// 以原始JSON字符串更新，空串或 `{}` 表示清空
    pub async fn update_from_json_str(&self, raw: &str) -> Result<(), MappingError> {
        let trimmed = raw.trim();
        let mapping = if trimmed.is_empty() || trimmed == "{}" {
            GlobalModelMapping::empty()
        } else {
            serde_json::from_str(trimmed)?
        };
        self.update(mapping).await
    }

    /// 重新从配置表读取，并重置轮询状态
    pub async fn reload(&self) -> Result<(), MappingError> {
        let _guard = self.write_lock.lock().await;
        let mapping = self.read_from_store().await?;
        self.swap(mapping);
        info!("全局模型映射已重新加载");
        Ok(())
    }

    pub fn snapshot(&self) -> Arc<GlobalModelMapping> {
        self.mapping
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn to_json(&self) -> Result<String, MappingError> {
        Ok(serde_json::to_string(self.snapshot().as_ref())?)
    }

    pub fn virtual_models(&self) -> Vec<String> {
        self.snapshot().virtual_models()
    }

    pub fn is_virtual(&self, model: &str) -> bool {
        self.snapshot().items(model).is_some()
    }

    async fn read_from_store(&self) -> Result<GlobalModelMapping, MappingError> {
        let raw = self.store.get_option(GLOBAL_MODEL_MAPPING_KEY).await?;
        let raw = match raw.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() && raw != "{}" => raw.to_string(),
            _ => return Ok(GlobalModelMapping::empty()),
        };
        let mapping: GlobalModelMapping = serde_json::from_str(&raw)?;
        if let Err(e) = validate_model_mapping(&mapping) {
            warn!("持久化的模型映射未通过校验: {}", e);
            return Err(e);
        }
        Ok(mapping)
    }

    fn swap(&self, mapping: GlobalModelMapping) {
        {
            let mut guard = self.mapping.write().unwrap_or_else(|e| e.into_inner());
            *guard = Arc::new(mapping);
        }
        self.counter
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reset();
    }
}
