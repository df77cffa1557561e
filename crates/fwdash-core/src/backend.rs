use fwdash_proto::fwdash::v1::{
    bridge_service_client::BridgeServiceClient, InvokeRequest, PushEvent, SubscribeRequest,
};
use serde_json::Value;
use tonic::{codec::Streaming, transport::Channel};

/// Request/response half of the backend. Calls carry no timeout of their own;
/// bounding them is the gateway's job.
#[tonic::async_trait]
pub trait Backend: Send + Sync {
    async fn invoke(&self, command: &str, args: Value) -> Result<Value, String>;
}

#[derive(Clone)]
pub struct GrpcBackend {
    client: BridgeServiceClient<Channel>,
}

impl GrpcBackend {
    pub async fn connect(addr: &str) -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self::new(connect(addr).await?))
    }

    pub fn new(channel: Channel) -> Self {
        Self {
            client: BridgeServiceClient::new(channel),
        }
    }

    pub async fn subscribe(
        &self,
        channels: &[&str],
    ) -> Result<Streaming<PushEvent>, tonic::Status> {
        let mut client = self.client.clone();
        let resp = client
            .subscribe(SubscribeRequest {
                channels: channels.iter().map(|c| c.to_string()).collect(),
            })
            .await?;
        Ok(resp.into_inner())
    }
}

#[tonic::async_trait]
impl Backend for GrpcBackend {
    async fn invoke(&self, command: &str, args: Value) -> Result<Value, String> {
        let mut client = self.client.clone();
        let args_json = if args.is_null() {
            String::new()
        } else {
            args.to_string()
        };
        let resp = client
            .invoke(InvokeRequest {
                command: command.to_string(),
                args_json,
            })
            .await
            .map_err(|status| status.message().to_string())?
            .into_inner();
        decode_result(&resp.result_json)
    }
}

fn decode_result(raw: &str) -> Result<Value, String> {
    if raw.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(raw).map_err(|e| format!("invalid result payload: {e}"))
}

async fn connect(addr: &str) -> Result<Channel, Box<dyn std::error::Error>> {
    let endpoint = format!("http://{addr}");
    Ok(Channel::from_shared(endpoint)?.connect().await?)
}
