//! Azure Resource Manager implementation of [`CloudProvider`].
//!
//! Authenticates with a service principal (client-credentials grant, token
//! cached until shortly before expiry) and follows `Azure-AsyncOperation`
//! headers for long-running operations.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{
    CloudError, CloudProvider, CommandOutput, NetworkIds, OsType, PowerState, RemoteScript,
    ScriptShell, VmStatus,
};
use crate::config::CloudConfig;
use crate::environment::{Access, AddressScope, Direction, SecurityRule};
use crate::model::TestEnvironment;

const RESOURCES_API: &str = "2021-04-01";
const NETWORK_API: &str = "2023-09-01";
const COMPUTE_API: &str = "2024-03-01";
const MANAGEMENT_SCOPE: &str = "https://management.azure.com/.default";
const STANDIN_ADMIN_USER: &str = "surebackup";

/// ARM client for the test subscription.
pub struct AzureCloud {
    config: CloudConfig,
    http: reqwest::Client,
    token: Mutex<Option<(String, Instant)>>,
    static_token: Option<String>,
    operation_poll_interval: Duration,
    max_operation_polls: u32,
}

impl AzureCloud {
    pub fn new(config: CloudConfig) -> Result<Self, CloudError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("surebackup/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| CloudError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            config,
            http,
            token: Mutex::new(None),
            static_token: None,
            operation_poll_interval: Duration::from_secs(5),
            max_operation_polls: 360,
        })
    }

    /// Skip the token exchange and always present `token`.
    pub fn with_static_token(mut self, token: &str) -> Self {
        self.static_token = Some(token.to_string());
        self
    }

    pub fn with_operation_poll_interval(mut self, interval: Duration) -> Self {
        self.operation_poll_interval = interval;
        self
    }

    async fn bearer(&self) -> Result<String, CloudError> {
        if let Some(token) = &self.static_token {
            return Ok(token.clone());
        }
        let mut cached = self.token.lock().await;
        if let Some((token, expiry)) = cached.as_ref() {
            if Instant::now() < *expiry {
                return Ok(token.clone());
            }
        }

        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.config.login_url.trim_end_matches('/'),
            self.config.tenant_id
        );
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("scope", MANAGEMENT_SCOPE),
        ];
        let response = self.http.post(&url).form(&params).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CloudError::Auth(format!("HTTP {status}: {body}")));
        }
        let body: Value = response.json().await?;
        let token = body["access_token"]
            .as_str()
            .ok_or_else(|| CloudError::Auth("no access_token in token response".into()))?
            .to_string();
        let expires_in = body["expires_in"].as_u64().unwrap_or(3600);
        let expiry = Instant::now() + Duration::from_secs(expires_in.saturating_sub(60));
        *cached = Some((token.clone(), expiry));
        Ok(token)
    }

    fn management(&self) -> &str {
        self.config.management_url.trim_end_matches('/')
    }

    fn resource_group_url(&self, resource_group: &str) -> String {
        format!(
            "{}/subscriptions/{}/resourcegroups/{}?api-version={}",
            self.management(),
            self.config.subscription_id,
            resource_group,
            RESOURCES_API
        )
    }

    fn resource_id(&self, resource_group: &str, provider_path: &str) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/{}",
            self.config.subscription_id, resource_group, provider_path
        )
    }

    fn resource_url(&self, resource_id: &str, api_version: &str) -> String {
        format!("{}{}?api-version={}", self.management(), resource_id, api_version)
    }

    fn vm_id(&self, resource_group: &str, vm_name: &str) -> String {
        self.resource_id(
            resource_group,
            &format!("Microsoft.Compute/virtualMachines/{vm_name}"),
        )
    }

    async fn arm_send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<(StatusCode, HeaderMap, Value), CloudError> {
        let token = self.bearer().await?;
        debug!(method = %method, url = %url, "ARM request");
        let mut request = self.http.request(method, url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let text = response.text().await.unwrap_or_default();
        let value: Value = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        if status == StatusCode::NOT_FOUND {
            return Err(CloudError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            return Err(CloudError::Api {
                status: status.as_u16(),
                message: arm_error_message(&value),
            });
        }
        Ok((status, headers, value))
    }

    /// Send and, for accepted long-running operations, wait for completion.
    async fn arm_send_and_wait(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Value, CloudError> {
        let (status, headers, value) = self.arm_send(method, url, body).await?;
        let operation_url = headers
            .get("Azure-AsyncOperation")
            .or_else(|| headers.get("Location"))
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        match operation_url {
            Some(op_url) if status == StatusCode::CREATED || status == StatusCode::ACCEPTED => {
                self.wait_for_operation(&op_url).await
            }
            _ => Ok(value),
        }
    }

    async fn wait_for_operation(&self, op_url: &str) -> Result<Value, CloudError> {
        for poll in 1..=self.max_operation_polls {
            let (_, _, body) = self.arm_send(Method::GET, op_url, None).await?;
            match body["status"].as_str().unwrap_or("InProgress") {
                "Succeeded" => return Ok(body),
                "Failed" | "Canceled" => {
                    return Err(CloudError::OperationFailed(arm_error_message(&body)));
                }
                _ => {}
            }
            // Location-style results return the payload directly, without a status.
            if body.get("status").is_none() && !body.is_null() {
                return Ok(body);
            }
            debug!(poll = poll, op_url = %op_url, "ARM operation pending");
            tokio::time::sleep(self.operation_poll_interval).await;
        }
        Err(CloudError::OperationFailed(format!(
            "operation did not finish after {} polls: {}",
            self.max_operation_polls, op_url
        )))
    }
}

fn arm_error_message(body: &Value) -> String {
    let err = &body["error"];
    match (err["code"].as_str(), err["message"].as_str()) {
        (Some(code), Some(message)) => format!("{code}: {message}"),
        (Some(code), None) => code.to_string(),
        _ => body.to_string(),
    }
}

fn address_prefix(scope: AddressScope, cidr: &str, platform_tag: &str) -> String {
    match scope {
        AddressScope::Any => "*".to_string(),
        AddressScope::IsolatedNetwork => cidr.to_string(),
        AddressScope::PlatformManagement => platform_tag.to_string(),
    }
}

fn security_rule_json(rule: &SecurityRule, cidr: &str, platform_tag: &str) -> Value {
    json!({
        "name": rule.name,
        "properties": {
            "priority": rule.priority,
            "direction": match rule.direction {
                Direction::Inbound => "Inbound",
                Direction::Outbound => "Outbound",
            },
            "access": match rule.access {
                Access::Allow => "Allow",
                Access::Deny => "Deny",
            },
            "protocol": "*",
            "sourceAddressPrefix": address_prefix(rule.source, cidr, platform_tag),
            "sourcePortRange": "*",
            "destinationAddressPrefix": address_prefix(rule.destination, cidr, platform_tag),
            "destinationPortRange": "*",
        }
    })
}

/// Parse a VM resource fetched with `$expand=instanceView`.
fn parse_vm_status(body: &Value) -> VmStatus {
    let properties = &body["properties"];
    let statuses = properties["instanceView"]["statuses"]
        .as_array()
        .cloned()
        .unwrap_or_default();

    let code_suffix = |prefix: &str| {
        statuses
            .iter()
            .filter_map(|s| s["code"].as_str())
            .find_map(|code| code.strip_prefix(prefix).map(str::to_string))
    };

    let power_state = code_suffix("PowerState/")
        .map(|s| PowerState::from_code(&s))
        .unwrap_or(PowerState::Unknown);
    let provisioning_state = code_suffix("ProvisioningState/")
        .or_else(|| properties["provisioningState"].as_str().map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string());
    let agent_ready = properties["instanceView"]["vmAgent"]["statuses"]
        .as_array()
        .map(|statuses| {
            statuses
                .iter()
                .any(|s| s["displayStatus"].as_str() == Some("Ready"))
        })
        .unwrap_or(false);
    let os_type = match properties["storageProfile"]["osDisk"]["osType"].as_str() {
        Some(os) if os.eq_ignore_ascii_case("windows") => OsType::Windows,
        _ => OsType::Linux,
    };

    VmStatus {
        power_state,
        provisioning_state,
        agent_ready,
        os_type,
    }
}

/// Extract stdout/stderr from a run-command result.
fn parse_command_output(body: &Value) -> CommandOutput {
    let entries = body["value"]
        .as_array()
        .or_else(|| body["properties"]["output"]["value"].as_array())
        .cloned()
        .unwrap_or_default();

    let mut output = CommandOutput::default();
    for entry in entries {
        let code = entry["code"].as_str().unwrap_or_default();
        let message = entry["message"].as_str().unwrap_or_default().trim();
        if code.contains("/StdOut/") {
            output.stdout.push_str(message);
        } else if code.contains("/StdErr/") {
            output.stderr.push_str(message);
        }
    }
    output
}

fn standin_password() -> String {
    format!("Sb!{}9", uuid::Uuid::new_v4().simple())
}

#[async_trait]
impl CloudProvider for AzureCloud {
    async fn create_resource_group(&self, name: &str, region: &str) -> Result<String, CloudError> {
        let body = json!({
            "location": region,
            "tags": { "purpose": "surebackup-test", "createdBy": "surebackup" },
        });
        let value = self
            .arm_send_and_wait(Method::PUT, &self.resource_group_url(name), Some(&body))
            .await?;
        Ok(value["id"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| format!("/subscriptions/{}/resourceGroups/{}", self.config.subscription_id, name)))
    }

    async fn create_security_group(
        &self,
        resource_group: &str,
        name: &str,
        region: &str,
        cidr: &str,
        rules: &[SecurityRule],
    ) -> Result<String, CloudError> {
        let id = self.resource_id(
            resource_group,
            &format!("Microsoft.Network/networkSecurityGroups/{name}"),
        );
        let body = json!({
            "location": region,
            "properties": {
                "securityRules": rules
                    .iter()
                    .map(|rule| security_rule_json(rule, cidr, &self.config.platform_service_tag))
                    .collect::<Vec<_>>(),
            }
        });
        self.arm_send_and_wait(Method::PUT, &self.resource_url(&id, NETWORK_API), Some(&body))
            .await?;
        Ok(id)
    }

    async fn create_network(
        &self,
        resource_group: &str,
        name: &str,
        region: &str,
        cidr: &str,
        security_group_id: &str,
    ) -> Result<NetworkIds, CloudError> {
        let network_id = self.resource_id(
            resource_group,
            &format!("Microsoft.Network/virtualNetworks/{name}"),
        );
        let body = json!({
            "location": region,
            "properties": {
                "addressSpace": { "addressPrefixes": [cidr] },
                "subnets": [{
                    "name": "default",
                    "properties": {
                        "addressPrefix": cidr,
                        "networkSecurityGroup": { "id": security_group_id },
                    }
                }],
            }
        });
        self.arm_send_and_wait(
            Method::PUT,
            &self.resource_url(&network_id, NETWORK_API),
            Some(&body),
        )
        .await?;
        Ok(NetworkIds {
            subnet_id: format!("{network_id}/subnets/default"),
            network_id,
        })
    }

    async fn deploy_standin_vm(
        &self,
        env: &TestEnvironment,
        vm_name: &str,
        vm_size: &str,
    ) -> Result<(), CloudError> {
        let nic_id = self.resource_id(
            &env.resource_group_name,
            &format!("Microsoft.Network/networkInterfaces/{vm_name}-nic"),
        );
        let nic_body = json!({
            "location": env.region,
            "properties": {
                "ipConfigurations": [{
                    "name": "ipconfig1",
                    "properties": {
                        "subnet": { "id": env.subnet_id },
                        "privateIPAllocationMethod": "Dynamic",
                    }
                }]
            }
        });
        self.arm_send_and_wait(
            Method::PUT,
            &self.resource_url(&nic_id, NETWORK_API),
            Some(&nic_body),
        )
        .await?;

        let vm_body = json!({
            "location": env.region,
            "tags": { "purpose": "surebackup-standin" },
            "properties": {
                "hardwareProfile": { "vmSize": vm_size },
                "storageProfile": {
                    "imageReference": {
                        "publisher": "Canonical",
                        "offer": "0001-com-ubuntu-server-jammy",
                        "sku": "22_04-lts-gen2",
                        "version": "latest",
                    },
                    "osDisk": { "createOption": "FromImage", "deleteOption": "Delete" },
                },
                "osProfile": {
                    "computerName": vm_name,
                    "adminUsername": STANDIN_ADMIN_USER,
                    "adminPassword": standin_password(),
                },
                "networkProfile": {
                    "networkInterfaces": [{ "id": nic_id }],
                },
            }
        });
        // Provisioning continues asynchronously; the orchestrator polls power state.
        self.arm_send(
            Method::PUT,
            &self.resource_url(&self.vm_id(&env.resource_group_name, vm_name), COMPUTE_API),
            Some(&vm_body),
        )
        .await?;
        info!(vm = %vm_name, resource_group = %env.resource_group_name, "stand-in VM deployment submitted");
        Ok(())
    }

    async fn vm_status(&self, resource_group: &str, vm_name: &str) -> Result<VmStatus, CloudError> {
        let url = format!(
            "{}&$expand=instanceView",
            self.resource_url(&self.vm_id(resource_group, vm_name), COMPUTE_API)
        );
        let (_, _, body) = self.arm_send(Method::GET, &url, None).await?;
        Ok(parse_vm_status(&body))
    }

    async fn run_command(
        &self,
        resource_group: &str,
        vm_name: &str,
        script: &RemoteScript,
    ) -> Result<CommandOutput, CloudError> {
        let url = format!(
            "{}{}/runCommand?api-version={}",
            self.management(),
            self.vm_id(resource_group, vm_name),
            COMPUTE_API
        );
        let command_id = match script.shell {
            ScriptShell::PowerShell => "RunPowerShellScript",
            ScriptShell::Shell => "RunShellScript",
        };
        let body = json!({ "commandId": command_id, "script": script.lines });
        let result = self.arm_send_and_wait(Method::POST, &url, Some(&body)).await?;
        Ok(parse_command_output(&result))
    }

    async fn delete_resource_group(&self, name: &str) -> Result<(), CloudError> {
        match self
            .arm_send(Method::DELETE, &self.resource_group_url(name), None)
            .await
        {
            Ok(_) | Err(CloudError::NotFound(_)) => {
                info!(resource_group = %name, "resource group deletion accepted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn manual_teardown_hint(&self, resource_group: &str) -> String {
        format!(
            "az group delete --name {} --subscription {} --yes --no-wait",
            resource_group, self.config.subscription_id
        )
    }
}
