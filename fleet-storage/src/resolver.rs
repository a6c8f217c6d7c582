//! Single-entity lookup keys.
//!
//! Each entity has a closed set of attributes it can be looked up by. A
//! resolver turns one of those into exactly one match expression; the store
//! layers tenant scoping and other options on top and reports `NotFound`
//! when nothing matches.

use crate::engine::Expr;
use fleet_core::{EntityType, FleetResult, StorageError, TenantId, UserId};
use uuid::Uuid;

/// Lookup key for one entity kind.
pub trait Resolver {
    const ENTITY: EntityType;

    /// Match expression selecting the entity. Fails on malformed keys.
    fn to_expr(&self) -> FleetResult<Expr>;

    /// The raw value, as reported in not-found errors.
    fn value(&self) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceResolver {
    TenantId(TenantId),
    Name(String),
}

impl Resolver for NamespaceResolver {
    const ENTITY: EntityType = EntityType::Namespace;

    fn to_expr(&self) -> FleetResult<Expr> {
        Ok(match self {
            NamespaceResolver::TenantId(id) => Expr::eq("tenant_id", id.as_str()),
            NamespaceResolver::Name(name) => Expr::eq("name", name.as_str()),
        })
    }

    fn value(&self) -> String {
        match self {
            NamespaceResolver::TenantId(v) | NamespaceResolver::Name(v) => v.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceResolver {
    Uid(String),
    Hostname(String),
    Mac(String),
}

impl Resolver for DeviceResolver {
    const ENTITY: EntityType = EntityType::Device;

    fn to_expr(&self) -> FleetResult<Expr> {
        Ok(match self {
            DeviceResolver::Uid(uid) => Expr::eq("uid", uid.as_str()),
            DeviceResolver::Hostname(name) => Expr::eq("name", name.as_str()),
            DeviceResolver::Mac(mac) => Expr::eq("identity.mac", mac.as_str()),
        })
    }

    fn value(&self) -> String {
        match self {
            DeviceResolver::Uid(v) | DeviceResolver::Hostname(v) | DeviceResolver::Mac(v) => {
                v.clone()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionResolver {
    Uid(String),
}

impl Resolver for SessionResolver {
    const ENTITY: EntityType = EntityType::Session;

    fn to_expr(&self) -> FleetResult<Expr> {
        let SessionResolver::Uid(uid) = self;
        Ok(Expr::eq("uid", uid.as_str()))
    }

    fn value(&self) -> String {
        let SessionResolver::Uid(uid) = self;
        uid.clone()
    }
}

/// Firewall rules are addressed by their UUID, given as a string by callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirewallRuleResolver {
    Id(String),
}

impl Resolver for FirewallRuleResolver {
    const ENTITY: EntityType = EntityType::FirewallRule;

    fn to_expr(&self) -> FleetResult<Expr> {
        let FirewallRuleResolver::Id(raw) = self;
        let id = parse_uuid(Self::ENTITY, raw)?;
        Ok(Expr::eq("id", id.to_string()))
    }

    fn value(&self) -> String {
        let FirewallRuleResolver::Id(raw) = self;
        raw.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKeyResolver {
    Fingerprint(String),
}

impl Resolver for PublicKeyResolver {
    const ENTITY: EntityType = EntityType::PublicKey;

    fn to_expr(&self) -> FleetResult<Expr> {
        let PublicKeyResolver::Fingerprint(fp) = self;
        Ok(Expr::eq("fingerprint", fp.as_str()))
    }

    fn value(&self) -> String {
        let PublicKeyResolver::Fingerprint(fp) = self;
        fp.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserResolver {
    Id(UserId),
    Email(String),
    Username(String),
}

impl Resolver for UserResolver {
    const ENTITY: EntityType = EntityType::User;

    fn to_expr(&self) -> FleetResult<Expr> {
        Ok(match self {
            UserResolver::Id(id) => Expr::eq("id", id.to_string()),
            UserResolver::Email(email) => Expr::eq("email", email.as_str()),
            UserResolver::Username(username) => Expr::eq("username", username.as_str()),
        })
    }

    fn value(&self) -> String {
        match self {
            UserResolver::Id(id) => id.to_string(),
            UserResolver::Email(v) | UserResolver::Username(v) => v.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiKeyResolver {
    /// Digest of the key secret.
    Id(String),
    Name(String),
}

impl Resolver for ApiKeyResolver {
    const ENTITY: EntityType = EntityType::ApiKey;

    fn to_expr(&self) -> FleetResult<Expr> {
        Ok(match self {
            ApiKeyResolver::Id(id) => Expr::eq("id", id.as_str()),
            ApiKeyResolver::Name(name) => Expr::eq("name", name.as_str()),
        })
    }

    fn value(&self) -> String {
        match self {
            ApiKeyResolver::Id(v) | ApiKeyResolver::Name(v) => v.clone(),
        }
    }
}

fn parse_uuid(entity_type: EntityType, raw: &str) -> FleetResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| {
        StorageError::InvalidIdentifier {
            entity_type,
            value: raw.to_string(),
        }
        .into()
    })
}
