mod ext_clients;
mod hosts;
mod networks;
mod nodes;

pub use ext_clients::update_ext_client_fields;
