use serde::Serialize;

use crate::config::Config;

#[derive(Debug, Clone, Serialize)]
pub struct CatalogDocument {
    pub services: Vec<Service>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub description: String,
    pub bindable: bool,
    pub metadata: ServiceMetadata,
    pub plans: Vec<Plan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dashboard_client: Option<DashboardClient>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceMetadata {
    #[serde(rename = "displayName")]
    pub display_name: String,
    #[serde(rename = "longDescription")]
    pub long_description: String,
    #[serde(rename = "documentationUrl", skip_serializing_if = "Option::is_none")]
    pub documentation_url: Option<String>,
    #[serde(rename = "supportUrl", skip_serializing_if = "Option::is_none")]
    pub support_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub description: String,
    pub free: bool,
    pub metadata: PlanMetadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanMetadata {
    pub bullets: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardClient {
    pub id: String,
    pub secret: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
}

pub fn build_catalog(config: &Config) -> CatalogDocument {
    let dashboard_url = (!config.dashboard_url.is_empty()).then(|| config.dashboard_url.clone());
    let dashboard_client =
        (!config.dashboard_client_secret.is_empty()).then(|| DashboardClient {
            id: config.dashboard_client_id.clone(),
            secret: config.dashboard_client_secret.clone(),
            redirect_uri: dashboard_url.clone(),
        });

    CatalogDocument {
        services: vec![Service {
            id: config.service_id.clone(),
            name: config.service_name.clone(),
            description: "Lease on-demand hardware as a service".to_string(),
            bindable: true,
            metadata: ServiceMetadata {
                display_name: config.service_name.clone(),
                long_description:
                    "Provision dedicated bare-metal hardware on demand and release it when finished."
                        .to_string(),
                documentation_url: dashboard_url.clone(),
                support_url: dashboard_url,
            },
            plans: vec![Plan {
                id: config.plan_id.clone(),
                name: config.plan_name.clone(),
                description: "A small instance of hardware as a service".to_string(),
                free: true,
                metadata: PlanMetadata {
                    bullets: vec![
                        "48gb Mem".to_string(),
                        "Supermicro".to_string(),
                        "2.7ghz X5650 2 socket".to_string(),
                        "24 core".to_string(),
                        "10 x 2TB disk sata".to_string(),
                    ],
                },
            }],
            dashboard_client,
        }],
    }
}
