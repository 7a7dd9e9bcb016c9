use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("Database operation failed: {0}")]
    DatabaseError(#[from] sqlx::error::Error),
    #[error("Unknown category {0}")]
    UnknownCategory(String),
}

/// Hard-rule thresholds consumed by the anomaly engine. Stored with the
/// policy so admins can retune without a restart.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnomalyThresholds {
    pub high_activity_total: i64,
    pub video_ratio: f64,
    pub social_ratio: f64,
    pub gaming_count: i64,
    pub combined_ratio: f64,
}

impl Default for AnomalyThresholds {
    fn default() -> Self {
        AnomalyThresholds {
            high_activity_total: 150,
            video_ratio: 0.40,
            social_ratio: 0.35,
            gaming_count: 5,
            combined_ratio: 0.60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CategoryPolicy {
    pub active: bool,
    pub sites: BTreeSet<String>,
}

/// A point-in-time snapshot of the filtering policy. Always passed by
/// value; an admin edit mid-sync can never produce a half-applied rule set.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PolicyConfig {
    pub manual_blocks: BTreeSet<String>,
    pub categories: BTreeMap<String, CategoryPolicy>,
    pub thresholds: AnomalyThresholds,
}

impl PolicyConfig {
    /// Union of the manual block list and every site in an active category.
    pub fn blocked_hostnames(&self) -> BTreeSet<String> {
        let mut hostnames: BTreeSet<String> = self
            .manual_blocks
            .iter()
            .map(|site| normalize_hostname(site))
            .collect();
        for category in self.categories.values() {
            if category.active {
                hostnames.extend(category.sites.iter().map(|site| normalize_hostname(site)));
            }
        }
        hostnames
    }
}

// Admin input arrives as pasted URLs as often as bare hostnames.
fn normalize_hostname(site: &str) -> String {
    let stripped = site
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    stripped
        .split('/')
        .next()
        .unwrap_or(stripped)
        .to_ascii_lowercase()
}

fn default_categories() -> BTreeMap<String, CategoryPolicy> {
    let catalogue: &[(&str, bool, &[&str])] = &[
        (
            "Gaming",
            true,
            &[
                "steampowered.com",
                "twitch.tv",
                "roblox.com",
                "epicgames.com",
                "ea.com",
                "playvalorant.com",
                "minecraft.net",
                "battle.net",
                "ubisoft.com",
            ],
        ),
        (
            "Social Media",
            false,
            &[
                "tiktok.com",
                "instagram.com",
                "facebook.com",
                "twitter.com",
                "reddit.com",
                "snapchat.com",
                "pinterest.com",
                "linkedin.com",
            ],
        ),
        (
            "Streaming",
            false,
            &[
                "youtube.com",
                "netflix.com",
                "hulu.com",
                "disneyplus.com",
                "hbomax.com",
                "primevideo.com",
                "spotify.com",
                "hotstar.com",
                "zee5.com",
                "sonyliv.com",
            ],
        ),
        (
            "Messaging",
            false,
            &["whatsapp.com", "telegram.org", "discord.gg", "signal.org"],
        ),
        (
            "File Sharing",
            true,
            &[
                "thepiratebay.org",
                "1337x.to",
                "wetransfer.com",
                "mediafire.com",
                "rarbg.to",
            ],
        ),
        (
            "Proxy/VPN",
            true,
            &[
                "nordvpn.com",
                "expressvpn.com",
                "hidemyass.com",
                "proxysite.com",
                "cyberghostvpn.com",
                "surfshark.com",
                "privateinternetaccess.com",
                "protonvpn.me",
                "tunnelbear.com",
            ],
        ),
    ];

    catalogue
        .iter()
        .map(|(name, active, sites)| {
            (
                (*name).to_owned(),
                CategoryPolicy {
                    active: *active,
                    sites: sites.iter().map(|site| (*site).to_owned()).collect(),
                },
            )
        })
        .collect()
}

impl Default for PolicyConfig {
    fn default() -> Self {
        PolicyConfig {
            manual_blocks: BTreeSet::new(),
            categories: default_categories(),
            thresholds: AnomalyThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct PolicyRow {
    manual_blocks: sqlx::types::Json<BTreeSet<String>>,
    categories: sqlx::types::Json<BTreeMap<String, CategoryPolicy>>,
    thresholds: sqlx::types::Json<AnomalyThresholds>,
}

/// Owner of the persisted singleton policy row. Reads return snapshots;
/// mutations write the whole row inside a transaction.
#[derive(Clone)]
pub struct PolicyStore {
    db_pool: Arc<sqlx::PgPool>,
    log: slog::Logger,
}

impl PolicyStore {
    pub fn new(db_pool: Arc<sqlx::PgPool>, log: slog::Logger) -> PolicyStore {
        PolicyStore { db_pool, log }
    }

    /// Load the current policy, seeding the default category catalogue on
    /// first contact.
    pub async fn snapshot(&self) -> Result<PolicyConfig, PolicyError> {
        let mut transaction = self.db_pool.begin().await?;
        let rows: Vec<PolicyRow> = sqlx::query_as(
            r#"SELECT "manual_blocks", "categories", "thresholds" FROM policy WHERE "id" = 1"#,
        )
        .fetch_all(&mut transaction)
        .await?;

        let config = match rows.into_iter().next() {
            Some(row) => PolicyConfig {
                manual_blocks: row.manual_blocks.0,
                categories: row.categories.0,
                thresholds: row.thresholds.0,
            },
            None => {
                let config = PolicyConfig::default();
                slog::info!(self.log, "seeding default filtering policy";
                    "categories" => config.categories.len());
                self.write_in(&mut transaction, &config).await?;
                config
            }
        };
        transaction.commit().await?;
        Ok(config)
    }

    pub async fn add_manual_block(&self, hostname: &str) -> Result<PolicyConfig, PolicyError> {
        self.mutate(|config| {
            config.manual_blocks.insert(normalize_hostname(hostname));
        })
        .await
    }

    pub async fn remove_manual_block(&self, hostname: &str) -> Result<PolicyConfig, PolicyError> {
        self.mutate(|config| {
            config.manual_blocks.remove(&normalize_hostname(hostname));
        })
        .await
    }

    /// Flip a category's active flag. Returns the fresh snapshot and the new
    /// flag state.
    pub async fn toggle_category(&self, name: &str) -> Result<(PolicyConfig, bool), PolicyError> {
        let mut transaction = self.db_pool.begin().await?;
        let mut config = self.load_in(&mut transaction).await?;
        let active = {
            let category = config
                .categories
                .get_mut(name)
                .ok_or_else(|| PolicyError::UnknownCategory(name.to_owned()))?;
            category.active = !category.active;
            category.active
        };
        self.write_in(&mut transaction, &config).await?;
        transaction.commit().await?;
        slog::info!(self.log, "category toggled"; "category" => name, "active" => active);
        Ok((config, active))
    }

    async fn mutate<F: Fn(&mut PolicyConfig)>(
        &self,
        apply: F,
    ) -> Result<PolicyConfig, PolicyError> {
        let mut transaction = self.db_pool.begin().await?;
        let mut config = self.load_in(&mut transaction).await?;
        apply(&mut config);
        self.write_in(&mut transaction, &config).await?;
        transaction.commit().await?;
        Ok(config)
    }

    async fn load_in(
        &self,
        transaction: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    ) -> Result<PolicyConfig, PolicyError> {
        let rows: Vec<PolicyRow> = sqlx::query_as(
            r#"SELECT "manual_blocks", "categories", "thresholds" FROM policy WHERE "id" = 1"#,
        )
        .fetch_all(transaction)
        .await?;
        Ok(match rows.into_iter().next() {
            Some(row) => PolicyConfig {
                manual_blocks: row.manual_blocks.0,
                categories: row.categories.0,
                thresholds: row.thresholds.0,
            },
            None => PolicyConfig::default(),
        })
    }

    async fn write_in(
        &self,
        transaction: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        config: &PolicyConfig,
    ) -> Result<(), PolicyError> {
        sqlx::query(
            r#"
            INSERT INTO policy("id", "manual_blocks", "categories", "thresholds")
            VALUES (1, $1, $2, $3)
            ON CONFLICT ("id") DO UPDATE
            SET "manual_blocks" = $1, "categories" = $2, "thresholds" = $3
            "#,
        )
        .bind(sqlx::types::Json(&config.manual_blocks))
        .bind(sqlx::types::Json(&config.categories))
        .bind(sqlx::types::Json(&config.thresholds))
        .execute(transaction)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_catalogue_seeded() {
        let config = PolicyConfig::default();
        assert!(config.categories.contains_key("Gaming"));
        assert!(config.categories["Gaming"].active);
        assert!(!config.categories["Streaming"].active);
        assert!(config.manual_blocks.is_empty());
        assert_eq!(config.thresholds, AnomalyThresholds::default());
    }

    #[test]
    fn test_blocked_hostnames_unions_manual_and_active() {
        let mut config = PolicyConfig::default();
        config.manual_blocks.insert("example.net".to_owned());
        let blocked = config.blocked_hostnames();
        assert!(blocked.contains("example.net"));
        // Gaming is active by default.
        assert!(blocked.contains("roblox.com"));
        // Streaming is inactive by default.
        assert!(!blocked.contains("netflix.com"));
    }

    #[test]
    fn test_blocked_hostnames_follow_toggle() {
        let mut config = PolicyConfig::default();
        config.categories.get_mut("Streaming").unwrap().active = true;
        assert!(config.blocked_hostnames().contains("netflix.com"));
    }

    #[test]
    fn test_normalize_hostname() {
        assert_eq!(normalize_hostname("https://Example.NET/path"), "example.net");
        assert_eq!(normalize_hostname("  example.net "), "example.net");
        assert_eq!(normalize_hostname("example.net"), "example.net");
    }
}
