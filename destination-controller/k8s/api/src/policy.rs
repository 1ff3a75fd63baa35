pub mod server;
pub mod server_authorization;

pub use self::{
    server::{Server, ServerSpec},
    server_authorization::{ServerAuthorization, ServerAuthorizationSpec},
};
