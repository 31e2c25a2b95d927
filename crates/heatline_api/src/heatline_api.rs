use crate::http::{run_heatline_http_server, HeatlineApiServices};
use common::http::HttpServerConfig;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct HeatlineApi {
    services: HeatlineApiServices,
    config: HttpServerConfig,
}

impl HeatlineApi {
    pub fn new(services: HeatlineApiServices, config: HttpServerConfig) -> Self {
        debug!("initializing heatline API module");
        Self { services, config }
    }

    pub fn into_runner_process(
        self,
    ) -> impl FnOnce(
        CancellationToken,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>,
    > {
        move |ctx| {
            Box::pin(async move { run_heatline_http_server(self.config, self.services, ctx).await })
        }
    }
}
