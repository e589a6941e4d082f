use std::sync::Arc;

use conveyor_config::{BrokerConfig, BrokerType};
use conveyor_domain::OrchestratorBackend;
use conveyor_errors::{ConveyorError, ConveyorResult};
use tracing::{debug, info};

use crate::memory::MemoryBroker;
use crate::rabbitmq::RabbitmqBackend;
use crate::redis::RedisBackend;

pub struct BackendFactory;

impl BackendFactory {
    /// 按配置构建编排后端；门面只持有接口，从不区分具体代理
    pub async fn create(config: &BrokerConfig) -> ConveyorResult<Arc<dyn OrchestratorBackend>> {
        Self::validate_config(config)?;
        debug!("Creating orchestrator backend with type: {:?}", config.r#type);

        match config.r#type {
            BrokerType::Memory => {
                info!("Initializing in-memory broker");
                let broker = MemoryBroker::new();
                Ok(Arc::new(broker))
            }
            BrokerType::Redis => {
                info!("Initializing Redis backend");
                let redis_config = config.redis.clone().ok_or_else(|| {
                    ConveyorError::Configuration(
                        "Redis配置缺失：需要提供redis配置段".to_string(),
                    )
                })?;
                let backend = RedisBackend::new(redis_config).await?;
                Ok(Arc::new(backend))
            }
            BrokerType::Rabbitmq => {
                info!("Initializing RabbitMQ backend");
                let rabbitmq_config = config.rabbitmq.clone().ok_or_else(|| {
                    ConveyorError::Configuration(
                        "RabbitMQ配置缺失：需要提供rabbitmq配置段".to_string(),
                    )
                })?;
                let backend = RabbitmqBackend::new(rabbitmq_config).await?;
                Ok(Arc::new(backend))
            }
        }
    }

    pub fn validate_config(config: &BrokerConfig) -> ConveyorResult<()> {
        config.validate()
    }

    /// 从Redis URL解析出连接配置
    pub fn parse_redis_url(url: &str) -> ConveyorResult<conveyor_config::RedisConfig> {
        let url = url::Url::parse(url)
            .map_err(|e| ConveyorError::Configuration(format!("无效的Redis URL: {e}")))?;
        if url.scheme() != "redis" && url.scheme() != "rediss" {
            return Err(ConveyorError::Configuration(format!(
                "Redis URL必须以redis://或rediss://开头: {url}"
            )));
        }

        let host = url.host_str().unwrap_or("127.0.0.1").to_string();
        let port = url.port().unwrap_or(6379);
        let database = if url.path().len() > 1 {
            url.path()[1..].parse().unwrap_or(0)
        } else {
            0
        };
        let password = url
            .password()
            .filter(|p| !p.is_empty())
            .map(|p| p.to_string());

        Ok(conveyor_config::RedisConfig {
            host,
            port,
            database,
            password,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_config::RabbitmqConfig;

    #[tokio::test]
    async fn test_create_memory_backend() {
        let backend = BackendFactory::create(&BrokerConfig::memory()).await.unwrap();
        assert!(backend.count_exchanges().await.is_err());
    }

    #[test]
    fn test_validate_rejects_bad_amqp_url() {
        let config = BrokerConfig::rabbitmq(RabbitmqConfig {
            url: "redis://wrong".to_string(),
            ..Default::default()
        });
        assert!(BackendFactory::validate_config(&config).is_err());
    }

    #[test]
    fn test_parse_redis_url() {
        let config = BackendFactory::parse_redis_url("redis://:pw@10.1.2.3:6380/4").unwrap();
        assert_eq!(config.host, "10.1.2.3");
        assert_eq!(config.port, 6380);
        assert_eq!(config.database, 4);
        assert_eq!(config.password.as_deref(), Some("pw"));

        assert!(BackendFactory::parse_redis_url("amqp://nope").is_err());
    }
}
