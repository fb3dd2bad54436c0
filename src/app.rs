use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use coordinator_api::create_app;
use coordinator_core::{config::ObservabilityConfig, AppConfig};
use coordinator_dispatcher::{CoordinatorServices, PeriodicService};
use coordinator_infrastructure::DatabaseManager;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::{net::TcpListener, sync::broadcast, task::JoinHandle};
use tracing::{error, info};

/// 主应用程序
pub struct Application {
    config: AppConfig,
    services: CoordinatorServices,
}

impl Application {
    /// 连接数据库并装配全部服务
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!("连接数据库: {}", mask_database_url(&config.database.url));
        let database = DatabaseManager::new(&config.database)
            .await
            .context("连接数据库失败")?;
        info!("数据库连接成功");

        let services = CoordinatorServices::build(&config, database);
        Ok(Self::with_services(config, services))
    }

    pub fn with_services(config: AppConfig, services: CoordinatorServices) -> Self {
        Self { config, services }
    }

    pub fn services(&self) -> &CoordinatorServices {
        &self.services
    }

    /// 运行后台循环和 HTTP 服务器，直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let periodic: Vec<Arc<dyn PeriodicService>> = vec![
            self.services.sweeper.clone() as Arc<dyn PeriodicService>,
            self.services.liveness.clone() as Arc<dyn PeriodicService>,
        ];
        let handles: Vec<JoinHandle<()>> = periodic
            .iter()
            .map(|service| spawn_periodic(Arc::clone(service)))
            .collect();

        let result = if self.config.api.enabled {
            self.run_api(shutdown_rx).await
        } else {
            info!("API服务器已禁用，只运行后台服务");
            let _ = shutdown_rx.recv().await;
            Ok(())
        };

        for service in &periodic {
            if let Err(e) = service.stop().await {
                error!("停止 {} 失败: {}", service.name(), e);
            }
        }
        for handle in handles {
            let _ = handle.await;
        }

        self.services.database.close().await;
        info!("协调器服务已停止");
        result
    }

    async fn run_api(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let app = create_app(self.services.clone(), &self.config.api);

        let listener = TcpListener::bind(&self.config.api.bind_address)
            .await
            .with_context(|| format!("绑定地址失败: {}", self.config.api.bind_address))?;
        info!("API服务器启动在 http://{}", listener.local_addr()?);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("API服务器收到关闭信号");
            })
            .await
            .context("API服务器运行失败")?;

        info!("API服务器已停止");
        Ok(())
    }
}

fn spawn_periodic(service: Arc<dyn PeriodicService>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = service.start().await {
            error!("{} 运行失败: {}", service.name(), e);
        }
    })
}

/// 按配置安装 Prometheus 导出器
pub fn install_metrics_exporter(config: &ObservabilityConfig) -> Result<()> {
    if !config.metrics_enabled {
        return Ok(());
    }

    let addr: SocketAddr = config
        .metrics_bind_address
        .parse()
        .with_context(|| format!("无效的指标监听地址: {}", config.metrics_bind_address))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("安装Prometheus导出器失败: {}", e))?;

    info!("Prometheus指标导出在 http://{}/metrics", addr);
    Ok(())
}

/// 屏蔽数据库URL中的敏感信息
fn mask_database_url(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            let mut masked = url.to_string();
            masked.replace_range(colon_pos + 1..at_pos, "***");
            return masked;
        }
    }
    url.to_string()
}
