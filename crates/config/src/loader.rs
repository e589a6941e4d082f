use config::{Config, Environment, File};
use conveyor_errors::{ConveyorError, ConveyorResult};
use serde::{Deserialize, Serialize};

use crate::models::{BrokerConfig, ClusterConfig};

/// 应用配置
///
/// 优先级：环境变量（CONVEYOR前缀）> 配置文件 > 默认值。
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
}

impl AppConfig {
    /// 加载配置；`path` 为None时只使用默认值和环境变量
    pub fn load(path: Option<&str>) -> ConveyorResult<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("CONVEYOR")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| ConveyorError::Configuration(format!("构建配置失败: {e}")))?;

        let app_config: AppConfig = config
            .try_deserialize()
            .map_err(|e| ConveyorError::Configuration(format!("解析配置失败: {e}")))?;

        app_config.validate()?;
        Ok(app_config)
    }

    pub fn validate(&self) -> ConveyorResult<()> {
        self.broker.validate()?;
        self.cluster.validate()?;
        Ok(())
    }
}
