//! Token registry: one active device address per (user, platform, address kind).
//!
//! Registration is an upsert on the unique key, so repeated registrations
//! converge on the latest address. Rows are deactivated, never deleted,
//! except by an explicit purge.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{AddressKind, DeviceToken, Platform};

use crate::dispatcher::TokenDirectory;

/// Longest address any provider hands out, with headroom.
const MAX_ADDRESS_LEN: usize = 4096;

/// Parameters for registering a device token.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RegisterTokenParams {
    pub user_id: Uuid,
    pub platform: Platform,
    pub address_kind: AddressKind,
    pub address: String,
}

/// PostgreSQL-backed token registry.
#[derive(Clone)]
pub struct TokenRegistry {
    pool: PgPool,
}

impl TokenRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Register (or re-register) a device address.
    ///
    /// Overwrites the address of an existing row for the same key and
    /// reactivates it. Other rows are never touched.
    pub async fn register(&self, params: &RegisterTokenParams) -> Result<DeviceToken, AppError> {
        let address = params.address.trim();
        Self::validate_address(params.address_kind, address)?;

        let token: DeviceToken = sqlx::query_as(
            r#"
            INSERT INTO device_tokens (id, user_id, platform, address_kind, address, is_active)
            VALUES ($1, $2, $3, $4, $5, true)
            ON CONFLICT (user_id, platform, address_kind) DO UPDATE
            SET address = EXCLUDED.address, is_active = true, updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(params.user_id)
        .bind(params.platform.to_string())
        .bind(params.address_kind.to_string())
        .bind(address)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            token_id = %token.id,
            user_id = %token.user_id,
            platform = %token.platform,
            address_kind = %token.address_kind,
            "Device token registered"
        );

        Ok(token)
    }

    /// Deactivate the token for a key. Returns true if an active row was changed.
    pub async fn deactivate(
        &self,
        user_id: Uuid,
        platform: Platform,
        address_kind: AddressKind,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE device_tokens
            SET is_active = false, updated_at = NOW()
            WHERE user_id = $1 AND platform = $2 AND address_kind = $3 AND is_active = true
            "#,
        )
        .bind(user_id)
        .bind(platform.to_string())
        .bind(address_kind.to_string())
        .execute(&self.pool)
        .await?;

        let changed = result.rows_affected() > 0;
        if changed {
            tracing::info!(
                user_id = %user_id,
                platform = %platform,
                address_kind = %address_kind,
                "Device token deactivated"
            );
        }
        Ok(changed)
    }

    /// Deactivate a token only if it still holds `address`.
    ///
    /// A provider rejection refers to the address that was sent to; if the
    /// client re-registered a new address in the meantime, the row is kept.
    pub async fn deactivate_address(&self, token: &DeviceToken) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE device_tokens
            SET is_active = false, updated_at = NOW()
            WHERE user_id = $1 AND platform = $2 AND address_kind = $3
              AND address = $4 AND is_active = true
            "#,
        )
        .bind(token.user_id)
        .bind(token.platform.to_string())
        .bind(token.address_kind.to_string())
        .bind(&token.address)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Active addresses for a user, optionally restricted to some platforms.
    ///
    /// An unknown user yields an empty list.
    pub async fn active_addresses(
        &self,
        user_id: Uuid,
        platforms: Option<&[Platform]>,
    ) -> Result<Vec<DeviceToken>, AppError> {
        let tokens: Vec<DeviceToken> = sqlx::query_as(
            "SELECT * FROM device_tokens WHERE user_id = $1 AND is_active = true ORDER BY updated_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(match platforms {
            Some(platforms) => tokens
                .into_iter()
                .filter(|t| platforms.contains(&t.platform))
                .collect(),
            None => tokens,
        })
    }

    /// Active addresses for many users in one query.
    pub async fn active_addresses_for(&self, user_ids: &[Uuid]) -> Result<Vec<DeviceToken>, AppError> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }

        let tokens: Vec<DeviceToken> = sqlx::query_as(
            "SELECT * FROM device_tokens WHERE user_id = ANY($1) AND is_active = true",
        )
        .bind(user_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(tokens)
    }

    /// Hard-delete inactive tokens last touched before `older_than`.
    pub async fn purge_inactive(&self, older_than: DateTime<Utc>) -> Result<u64, AppError> {
        let purged = sqlx::query(
            "DELETE FROM device_tokens WHERE is_active = false AND updated_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?
        .rows_affected();

        tracing::info!(purged, older_than = %older_than, "Inactive device tokens purged");
        Ok(purged)
    }

    fn validate_address(kind: AddressKind, address: &str) -> Result<(), AppError> {
        if address.is_empty() {
            return Err(AppError::Validation("address must not be empty".to_string()));
        }
        if address.len() > MAX_ADDRESS_LEN {
            return Err(AppError::Validation(format!(
                "address exceeds {} bytes",
                MAX_ADDRESS_LEN
            )));
        }
        if address.chars().any(char::is_whitespace) {
            return Err(AppError::Validation(
                "address must not contain whitespace".to_string(),
            ));
        }

        match kind {
            AddressKind::Expo => {
                let well_formed = (address.starts_with("ExponentPushToken[")
                    || address.starts_with("ExpoPushToken["))
                    && address.ends_with(']');
                if !well_formed {
                    return Err(AppError::Validation(
                        "expo address must look like ExponentPushToken[...]".to_string(),
                    ));
                }
            }
            AddressKind::Apns => {
                if !address.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(AppError::Validation(
                        "apns address must be a hex device token".to_string(),
                    ));
                }
            }
            AddressKind::Fcm => {}
        }

        Ok(())
    }
}

#[async_trait]
impl TokenDirectory for TokenRegistry {
    async fn active_tokens(&self, user_ids: &[Uuid]) -> Result<Vec<DeviceToken>, AppError> {
        self.active_addresses_for(user_ids).await
    }

    async fn deactivate_token(&self, token: &DeviceToken) -> Result<bool, AppError> {
        self.deactivate_address(token).await
    }
}
