//! Typed helpers for the portal's user and product endpoints.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ApiError, ErrorKind};
use crate::request::{Body, Params, RequestOverrides};
use crate::{PortalClient, Result};

fn json_body<B: Serialize + ?Sized>(body: &B) -> Result<Body> {
    Body::json(body).map_err(|err| {
        ApiError::new(ErrorKind::Unknown, format!("failed to serialize request body: {err}"))
    })
}

fn item_path(collection: &str, id: &str) -> String {
    format!("{collection}/{}", urlencoding::encode(id))
}

/// Authentication and user administration endpoints.
#[derive(Clone, Debug)]
pub struct UserService {
    client: PortalClient,
}

impl UserService {
    pub fn new(client: PortalClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &PortalClient {
        &self.client
    }

    pub async fn login<T, B>(&self, credentials: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let body = json_body(credentials)?;
        self.client
            .post("/auth/login", body, RequestOverrides::new())
            .await
    }

    pub async fn register<T, B>(&self, user: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let body = json_body(user)?;
        self.client
            .post("/auth/register", body, RequestOverrides::new())
            .await
    }

    pub async fn user_info<T: DeserializeOwned>(&self, user_id: &str) -> Result<T> {
        self.client
            .get(&item_path("/users", user_id), (), RequestOverrides::new())
            .await
    }

    pub async fn update_user<T, B>(&self, user_id: &str, user: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let body = json_body(user)?;
        self.client
            .put(&item_path("/users", user_id), body, RequestOverrides::new())
            .await
    }

    /// Lists users; `overrides` is passed through, e.g. for a request id.
    pub async fn users<T: DeserializeOwned>(
        &self,
        params: impl Into<Params>,
        overrides: RequestOverrides,
    ) -> Result<T> {
        self.client.get("/users", params, overrides).await
    }

    pub async fn delete_user<T: DeserializeOwned>(&self, user_id: &str) -> Result<T> {
        self.client
            .delete(&item_path("/users", user_id), (), RequestOverrides::new())
            .await
    }
}

/// Catalogue endpoints.
#[derive(Clone, Debug)]
pub struct ProductService {
    client: PortalClient,
}

impl ProductService {
    pub fn new(client: PortalClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &PortalClient {
        &self.client
    }

    pub async fn products<T: DeserializeOwned>(&self, params: impl Into<Params>) -> Result<T> {
        self.client
            .get("/products", params, RequestOverrides::new())
            .await
    }

    pub async fn product<T: DeserializeOwned>(&self, product_id: &str) -> Result<T> {
        self.client
            .get(&item_path("/products", product_id), (), RequestOverrides::new())
            .await
    }

    pub async fn create_product<T, B>(&self, product: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let body = json_body(product)?;
        self.client
            .post("/products", body, RequestOverrides::new())
            .await
    }

    pub async fn update_product<T, B>(&self, product_id: &str, product: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let body = json_body(product)?;
        self.client
            .put(&item_path("/products", product_id), body, RequestOverrides::new())
            .await
    }

    pub async fn delete_product<T: DeserializeOwned>(&self, product_id: &str) -> Result<T> {
        self.client
            .delete(&item_path("/products", product_id), (), RequestOverrides::new())
            .await
    }

    pub async fn categories<T: DeserializeOwned>(&self) -> Result<T> {
        self.client
            .get("/products/categories", (), RequestOverrides::new())
            .await
    }

    pub async fn reviews<T: DeserializeOwned>(
        &self,
        product_id: &str,
        params: impl Into<Params>,
    ) -> Result<T> {
        let path = format!("{}/reviews", item_path("/products", product_id));
        self.client.get(&path, params, RequestOverrides::new()).await
    }
}

#[cfg(test)]
mod tests {
    use super::item_path;

    #[test]
    fn ids_are_path_encoded() {
        assert_eq!(item_path("/users", "42"), "/users/42");
        assert_eq!(item_path("/users", "a/b c"), "/users/a%2Fb%20c");
    }
}
