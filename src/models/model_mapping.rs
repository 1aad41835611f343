use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;
use utoipa::ToSchema;
use validator::{Validate, ValidationError};

/// 模型映射项：一个实际的上游模型及其优先级
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate, ToSchema)]
pub struct ModelMappingItem {
    /// 实际模型名
    #[validate(custom = "not_blank")]
    pub model: String,
    /// 优先级（非负整数，数值越大越优先）
    #[serde(rename = "priorities")]
    #[validate(range(min = 0))]
    pub priority: i64,
}

impl ModelMappingItem {
    pub fn new(model: impl Into<String>, priority: i64) -> Self {
        Self {
            model: model.into(),
            priority,
        }
    }
}

/// 全局模型映射配置：虚拟模型名 -> 实际模型列表
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct GlobalModelMapping {
    /// 缺失时反序列化为 None，校验时拒绝
    #[serde(default)]
    pub mapping: Option<BTreeMap<String, Vec<ModelMappingItem>>>,
}

impl GlobalModelMapping {
    pub fn empty() -> Self {
        Self {
            mapping: Some(BTreeMap::new()),
        }
    }

    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, Vec<ModelMappingItem>)>,
    {
        Self {
            mapping: Some(entries.into_iter().collect()),
        }
    }

    pub fn items(&self, virtual_model: &str) -> Option<&[ModelMappingItem]> {
        self.mapping
            .as_ref()
            .and_then(|m| m.get(virtual_model))
            .map(Vec::as_slice)
    }

    pub fn virtual_models(&self) -> Vec<String> {
        self.mapping
            .as_ref()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.as_ref().map_or(true, BTreeMap::is_empty)
    }
}

/// 模型映射错误
#[derive(Debug, Error)]
pub enum MappingError {
    #[error("mapping table must not be empty")]
    MissingMapping,
    #[error("virtual model name must not be blank")]
    BlankVirtualModel,
    #[error("virtual model '{0}' has no mapping items")]
    EmptyItems(String),
    #[error("item #{index} of virtual model '{virtual_model}' has a blank model name")]
    BlankModel { virtual_model: String, index: usize },
    #[error("priority of model '{model}' in virtual model '{virtual_model}' must be non-negative")]
    NegativePriority { virtual_model: String, model: String },
    #[error("virtual model '{virtual_model}' contains duplicate model '{model}'")]
    DuplicateModel { virtual_model: String, model: String },
    #[error("failed to parse model mapping: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to persist model mapping: {0}")]
    Storage(#[from] anyhow::Error),
}

fn not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new("blank"));
    }
    Ok(())
}

/// 校验整份模型映射配置，任何一项不合法即整体拒绝
pub fn validate_model_mapping(mapping: &GlobalModelMapping) -> Result<(), MappingError> {
    let table = mapping.mapping.as_ref().ok_or(MappingError::MissingMapping)?;

    for (virtual_model, items) in table {
        if virtual_model.trim().is_empty() {
            return Err(MappingError::BlankVirtualModel);
        }
        if items.is_empty() {
            return Err(MappingError::EmptyItems(virtual_model.clone()));
        }

        let mut seen = HashSet::new();
        for (index, item) in items.iter().enumerate() {
            if let Err(errors) = item.validate() {
                let fields = errors.field_errors();
                if fields.contains_key("model") {
                    return Err(MappingError::BlankModel {
                        virtual_model: virtual_model.clone(),
                        index: index + 1,
                    });
                }
                return Err(MappingError::NegativePriority {
                    virtual_model: virtual_model.clone(),
                    model: item.model.clone(),
                });
            }

            let trimmed = item.model.trim();
            if !seen.insert(trimmed) {
                return Err(MappingError::DuplicateModel {
                    virtual_model: virtual_model.clone(),
                    model: trimmed.to_string(),
                });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> GlobalModelMapping {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn accepts_well_formed_mapping() {
        let mapping = parse(
            r#"{"mapping":{"gpt-4-virtual":[{"model":"gpt-4-a","priorities":10},{"model":"gpt-4-b","priorities":5}]}}"#,
        );
        assert!(validate_model_mapping(&mapping).is_ok());
    }

    #[test]
    fn accepts_empty_table() {
        assert!(validate_model_mapping(&GlobalModelMapping::empty()).is_ok());
    }

    #[test]
    fn rejects_missing_table() {
        let mapping = parse("{}");
        assert!(matches!(
            validate_model_mapping(&mapping),
            Err(MappingError::MissingMapping)
        ));
    }

    #[test]
    fn rejects_blank_virtual_model() {
        let mapping = parse(r#"{"mapping":{"  ":[{"model":"a","priorities":1}]}}"#);
        assert!(matches!(
            validate_model_mapping(&mapping),
            Err(MappingError::BlankVirtualModel)
        ));
    }

    #[test]
    fn rejects_empty_item_list() {
        let mapping = parse(r#"{"mapping":{"gpt-4":[]}}"#);
        assert!(matches!(
            validate_model_mapping(&mapping),
            Err(MappingError::EmptyItems(name)) if name == "gpt-4"
        ));
    }

    #[test]
    fn rejects_blank_model_name() {
        let mapping = parse(
            r#"{"mapping":{"gpt-4":[{"model":"a","priorities":1},{"model":" ","priorities":1}]}}"#,
        );
        assert!(matches!(
            validate_model_mapping(&mapping),
            Err(MappingError::BlankModel { index: 2, .. })
        ));
    }

    #[test]
    fn rejects_negative_priority() {
        let mapping = parse(r#"{"mapping":{"gpt-4":[{"model":"a","priorities":-1}]}}"#);
        assert!(matches!(
            validate_model_mapping(&mapping),
            Err(MappingError::NegativePriority { .. })
        ));
    }

    #[test]
    fn rejects_duplicate_models_within_one_virtual_model() {
        let mapping = parse(
            r#"{"mapping":{"gpt-4":[{"model":"gpt-4-a","priorities":5},{"model":"gpt-4-a","priorities":1}]}}"#,
        );
        match validate_model_mapping(&mapping) {
            Err(MappingError::DuplicateModel { model, .. }) => assert_eq!(model, "gpt-4-a"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn same_model_under_different_virtual_models_is_fine() {
        let mapping = parse(
            r#"{"mapping":{"a":[{"model":"x","priorities":1}],"b":[{"model":"x","priorities":1}]}}"#,
        );
        assert!(validate_model_mapping(&mapping).is_ok());
    }
}
