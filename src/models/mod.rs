// 导出所有模型组件

pub mod channel;
pub mod model_mapping;
pub mod token;

// 重新导出核心类型
pub use channel::{Channel, ChannelSetting, ChannelStatus, ChannelType};
pub use model_mapping::{GlobalModelMapping, MappingError, ModelMappingItem};
pub use token::TokenInfo;
