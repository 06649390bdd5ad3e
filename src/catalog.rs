//! Event catalog: the closed set of event kinds services agree on.
//!
//! Each kind maps to exactly one exchange and one default routing key.
//! Producers and consumers share this mapping by convention, never through a
//! runtime registry, so the set is append-only: entries are never renamed or
//! removed, only added.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::bus::ExchangeDeclaration;

/// Exchange used by the auth service for outbound email notifications.
const AUTH_EMAIL_EXCHANGE: &str = "ecom-email-notification";
/// Shared exchange for product record changes.
const PRODUCT_SERVICE_EXCHANGE: &str = "product-service";
/// Shared exchange for cart record changes.
const CART_SERVICE_EXCHANGE: &str = "cart-service";

/// Domain event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    SellerCreated,
    SellerUpdated,
    ProductCreated,
    ProductUpdated,
    ProductDeleted,
    OrderCreated,
    OrderUpdated,
    OrderCanceled,
    ProductAddedToCart,
    ProductRemovedFromCart,
    CartCreated,
    CartUpdated,
    CartDeleted,
    UserForgotPassword,
    UserResetPassword,
    AuthEmail,
}

/// Where a kind's messages go by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub exchange: &'static str,
    pub routing_key: &'static str,
}

impl EventKind {
    /// Every catalog entry, in declaration order.
    pub const ALL: [EventKind; 16] = [
        EventKind::SellerCreated,
        EventKind::SellerUpdated,
        EventKind::ProductCreated,
        EventKind::ProductUpdated,
        EventKind::ProductDeleted,
        EventKind::OrderCreated,
        EventKind::OrderUpdated,
        EventKind::OrderCanceled,
        EventKind::ProductAddedToCart,
        EventKind::ProductRemovedFromCart,
        EventKind::CartCreated,
        EventKind::CartUpdated,
        EventKind::CartDeleted,
        EventKind::UserForgotPassword,
        EventKind::UserResetPassword,
        EventKind::AuthEmail,
    ];

    /// Wire token for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SellerCreated => "seller-created",
            EventKind::SellerUpdated => "seller-updated",
            EventKind::ProductCreated => "product-created",
            EventKind::ProductUpdated => "product-updated",
            EventKind::ProductDeleted => "product-deleted",
            EventKind::OrderCreated => "order-created",
            EventKind::OrderUpdated => "order-updated",
            EventKind::OrderCanceled => "order-canceled",
            EventKind::ProductAddedToCart => "product-added-to-cart",
            EventKind::ProductRemovedFromCart => "product-removed-from-cart",
            EventKind::CartCreated => "cart-created",
            EventKind::CartUpdated => "cart-updated",
            EventKind::CartDeleted => "cart-deleted",
            EventKind::UserForgotPassword => "user-forgot-password",
            EventKind::UserResetPassword => "user-reset-password",
            EventKind::AuthEmail => "auth-email",
        }
    }

    /// Exchange and default routing key for this kind.
    ///
    /// Product and cart changes share one exchange per owning service and are
    /// told apart by routing key. Every other kind has an exchange of its own.
    pub fn route(&self) -> Route {
        let exchange = match self {
            EventKind::AuthEmail => AUTH_EMAIL_EXCHANGE,
            EventKind::ProductCreated | EventKind::ProductUpdated | EventKind::ProductDeleted => {
                PRODUCT_SERVICE_EXCHANGE
            }
            EventKind::CartCreated | EventKind::CartUpdated | EventKind::CartDeleted => {
                CART_SERVICE_EXCHANGE
            }
            other => other.as_str(),
        };
        Route {
            exchange,
            routing_key: self.as_str(),
        }
    }

    pub fn exchange_name(&self) -> &'static str {
        self.route().exchange
    }

    pub fn default_routing_key(&self) -> &'static str {
        self.route().routing_key
    }

    /// Topology the publisher declares before sending this kind.
    ///
    /// Every catalog exchange is a durable direct exchange.
    pub fn declaration(&self) -> ExchangeDeclaration {
        ExchangeDeclaration::direct(self.exchange_name())
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a token is not part of the catalog.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown event kind: {0}")]
pub struct UnknownEventKind(pub String);

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownEventKind(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ExchangeKind;
    use std::collections::HashSet;

    #[test]
    fn test_route_is_stable_across_calls() {
        for kind in EventKind::ALL {
            assert_eq!(kind.route(), kind.route());
            assert_eq!(kind.declaration(), kind.declaration());
        }
    }

    #[test]
    fn test_tokens_are_unique_and_round_trip() {
        let tokens: HashSet<&str> = EventKind::ALL.iter().map(|k| k.as_str()).collect();
        assert_eq!(tokens.len(), EventKind::ALL.len());

        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_order_created_route() {
        let route = EventKind::OrderCreated.route();
        assert_eq!(route.exchange, "order-created");
        assert_eq!(route.routing_key, "order-created");
    }

    #[test]
    fn test_auth_email_uses_notification_exchange() {
        assert_eq!(EventKind::AuthEmail.exchange_name(), "ecom-email-notification");
        assert_eq!(EventKind::AuthEmail.default_routing_key(), "auth-email");
    }

    #[test]
    fn test_exchange_names_are_pinned() {
        let expected = [
            (EventKind::SellerCreated, "seller-created"),
            (EventKind::SellerUpdated, "seller-updated"),
            (EventKind::ProductCreated, "product-service"),
            (EventKind::ProductUpdated, "product-service"),
            (EventKind::ProductDeleted, "product-service"),
            (EventKind::OrderCreated, "order-created"),
            (EventKind::OrderUpdated, "order-updated"),
            (EventKind::OrderCanceled, "order-canceled"),
            (EventKind::ProductAddedToCart, "product-added-to-cart"),
            (EventKind::ProductRemovedFromCart, "product-removed-from-cart"),
            (EventKind::CartCreated, "cart-service"),
            (EventKind::CartUpdated, "cart-service"),
            (EventKind::CartDeleted, "cart-service"),
            (EventKind::UserForgotPassword, "user-forgot-password"),
            (EventKind::UserResetPassword, "user-reset-password"),
            (EventKind::AuthEmail, "ecom-email-notification"),
        ];
        assert_eq!(expected.len(), EventKind::ALL.len());

        for (kind, exchange) in expected {
            assert_eq!(kind.exchange_name(), exchange, "{kind}");
            assert_eq!(kind.declaration().name, exchange, "{kind}");
        }
    }

    #[test]
    fn test_default_routing_key_is_token() {
        for kind in EventKind::ALL {
            assert_eq!(kind.default_routing_key(), kind.as_str());
        }
        let route = EventKind::CartDeleted.route();
        assert_eq!(route.exchange, "cart-service");
        assert_eq!(route.routing_key, "cart-deleted");
    }

    #[test]
    fn test_declaration_is_durable_direct() {
        let decl = EventKind::ProductCreated.declaration();
        assert_eq!(decl.name, "product-service");
        assert_eq!(decl.kind, ExchangeKind::Direct);
        assert!(decl.durable);
        assert!(!decl.auto_delete);
        assert!(!decl.internal);
    }

    #[test]
    fn test_unknown_token_rejected() {
        let err = "order-cancelled".parse::<EventKind>().unwrap_err();
        assert_eq!(err, UnknownEventKind("order-cancelled".to_string()));
    }

    #[test]
    fn test_serde_uses_wire_token() {
        let json = serde_json::to_string(&EventKind::ProductRemovedFromCart).unwrap();
        assert_eq!(json, "\"product-removed-from-cart\"");

        let kind: EventKind = serde_json::from_str("\"order-canceled\"").unwrap();
        assert_eq!(kind, EventKind::OrderCanceled);
    }
}
