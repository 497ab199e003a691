pub mod registry;

use oci_mirror::auth::StaticProvider;
use oci_mirror::{Reference, Registry};

/// Client for a test registry, with basic credentials and retries
/// kept low so failure tests stay fast.
pub fn client() -> Registry {
    Registry::builder()
        .auth_provider(StaticProvider::username_password("myuser", "mypass"))
        .insecure(true)
        .retries(2)
        .build()
        .unwrap()
}

/// Reference under `library/` on the given test registry.
pub fn reference(host: &str, name: &str) -> Reference {
    Reference::parse(&format!("{host}/library/{name}")).unwrap()
}
