//! Stand-in for the `proxmox-router` crate, covering only the API
//! surface the metadump CLI uses: the method descriptor the `#[api]`
//! macro expands to, the RPC environment trait, and the command line
//! interface runner behind the `cli` feature.

use anyhow::Error;
use serde_json::Value;

#[cfg(feature = "cli")]
pub mod cli;

/// Synchronous API handler: JSON parameters in, JSON result out.
pub type ApiHandlerFn = fn(Value, &ApiMethod, &mut dyn RpcEnvironment) -> Result<Value, Error>;

/// The handler of an [`ApiMethod`].
pub enum ApiHandler {
    Sync(ApiHandlerFn),
}

/// One callable API method: its input parameter schema and handler.
pub struct ApiMethod {
    pub parameters: &'static proxmox_schema::ObjectSchema,
    pub handler: &'static ApiHandler,
}

impl ApiMethod {
    pub const fn new(
        handler: &'static ApiHandler,
        parameters: &'static proxmox_schema::ObjectSchema,
    ) -> Self {
        Self {
            parameters,
            handler,
        }
    }
}

/// Environment type of an [`RpcEnvironment`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RpcEnvironmentType {
    Cli,
}

/// Access to the environment a handler runs in.
pub trait RpcEnvironment {
    /// Result attributes the handler may set.
    fn result_attrib_mut(&mut self) -> &mut Value;

    /// Result attributes.
    fn result_attrib(&self) -> &Value;

    /// The environment type.
    fn env_type(&self) -> RpcEnvironmentType;

    /// Set the authentication id of the caller.
    fn set_auth_id(&mut self, auth_id: Option<String>);

    /// The authentication id of the caller.
    fn get_auth_id(&self) -> Option<String>;
}
