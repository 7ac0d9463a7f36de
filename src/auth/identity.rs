//! Authenticated identity extractor
//!
//! Reads the caller identity forwarded by the gateway.

use crate::auth::Role;
use crate::error::AppError;
use axum::{extract::FromRequestParts, http::request::Parts};
use uuid::Uuid;

pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const ACTOR_ROLE_HEADER: &str = "x-actor-role";

/// The already-authenticated caller of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: Uuid,
    pub role: Role,
}

impl Actor {
    pub fn require_admin(&self) -> Result<(), AppError> {
        if !self.role.can_administer() {
            return Err(AppError::Permission(format!(
                "Requires admin role, you have {}",
                self.role
            )));
        }
        Ok(())
    }

    pub fn require_proposer(&self) -> Result<(), AppError> {
        if !self.role.can_propose() {
            return Err(AppError::Permission(format!(
                "Role {} cannot propose changes",
                self.role
            )));
        }
        Ok(())
    }
}

fn header<'a>(parts: &'a Parts, name: &str) -> Result<&'a str, AppError> {
    parts
        .headers
        .get(name)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| AppError::Unauthenticated(format!("Missing {} header", name)))
}

impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = header(parts, ACTOR_ID_HEADER)?
            .parse::<Uuid>()
            .map_err(|_| AppError::Unauthenticated(format!("Invalid {} header", ACTOR_ID_HEADER)))?;

        let role = header(parts, ACTOR_ROLE_HEADER)?
            .parse::<Role>()
            .map_err(AppError::Unauthenticated)?;

        Ok(Actor { id, role })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(request: Request<()>) -> Result<Actor, AppError> {
        let (mut parts, _) = request.into_parts();
        Actor::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_extracts_actor_from_headers() {
        let id = Uuid::new_v4();
        let request = Request::builder()
            .header(ACTOR_ID_HEADER, id.to_string())
            .header(ACTOR_ROLE_HEADER, "manager")
            .body(())
            .unwrap();

        let actor = extract(request).await.unwrap();
        assert_eq!(actor, Actor { id, role: Role::Manager });
    }

    #[tokio::test]
    async fn test_missing_or_bad_headers_are_unauthenticated() {
        let missing = Request::builder().body(()).unwrap();
        assert!(matches!(extract(missing).await, Err(AppError::Unauthenticated(_))));

        let bad_role = Request::builder()
            .header(ACTOR_ID_HEADER, Uuid::new_v4().to_string())
            .header(ACTOR_ROLE_HEADER, "overlord")
            .body(())
            .unwrap();
        assert!(matches!(extract(bad_role).await, Err(AppError::Unauthenticated(_))));
    }
}
