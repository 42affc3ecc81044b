//! GraphQL documents sent to the registry.
//!
//! Every document aliases its payload as `result` so responses decode into
//! [`ResultEnvelope`](super::types::ResultEnvelope).

const CLUSTER_FIELDS: &str = "id name description labels status { condition }";

pub(crate) fn register_cluster() -> String {
    "mutation ($in: RuntimeInput!) { result: registerRuntime(in: $in) { id } }".to_string()
}

pub(crate) fn get_cluster() -> String {
    format!("query ($id: ID!) {{ result: runtime(id: $id) {{ {CLUSTER_FIELDS} }} }}")
}

pub(crate) fn update_cluster() -> String {
    "mutation ($id: ID!, $in: RuntimeInput!) { result: updateRuntime(id: $id, in: $in) { id } }"
        .to_string()
}

pub(crate) fn unregister_cluster() -> String {
    "mutation ($id: ID!) { result: unregisterRuntime(id: $id) { id } }".to_string()
}

pub(crate) fn request_one_time_token() -> String {
    "mutation ($id: ID!) { result: requestOneTimeTokenForRuntime(id: $id) { token connectorURL } }"
        .to_string()
}
