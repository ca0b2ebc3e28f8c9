pub mod apply_request;
pub mod capi;
pub mod cluster;
pub mod control_plane;
pub mod machine;
pub mod machine_deployment;
pub mod machine_set;
pub mod shared;
pub mod template;
pub mod workspace;
