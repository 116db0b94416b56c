use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Client platform a device token was registered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
    Web,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::Ios => write!(f, "ios"),
            Platform::Android => write!(f, "android"),
            Platform::Web => write!(f, "web"),
        }
    }
}

/// Push provider an address belongs to.
///
/// - `Expo`: gateway with batch JSON array submission
/// - `Fcm`: gateway with one JSON message per device (also serves web push)
/// - `Apns`: certificate-authenticated channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AddressKind {
    Expo,
    Fcm,
    Apns,
}

impl std::fmt::Display for AddressKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressKind::Expo => write!(f, "expo"),
            AddressKind::Fcm => write!(f, "fcm"),
            AddressKind::Apns => write!(f, "apns"),
        }
    }
}

/// Notification class. Conversation and update notifications are skipped
/// while the recipient is present in the matching context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum NotificationCategory {
    Conversation,
    Update,
    Reminder,
    Broadcast,
    System,
}

impl NotificationCategory {
    pub fn is_suppressible(self) -> bool {
        matches!(
            self,
            NotificationCategory::Conversation | NotificationCategory::Update
        )
    }
}

impl std::fmt::Display for NotificationCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationCategory::Conversation => write!(f, "conversation"),
            NotificationCategory::Update => write!(f, "update"),
            NotificationCategory::Reminder => write!(f, "reminder"),
            NotificationCategory::Broadcast => write!(f, "broadcast"),
            NotificationCategory::System => write!(f, "system"),
        }
    }
}

/// What created a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Manual,
    Automated,
    Broadcast,
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceType::Manual => write!(f, "manual"),
            SourceType::Automated => write!(f, "automated"),
            SourceType::Broadcast => write!(f, "broadcast"),
        }
    }
}

/// Delivery priority. High priority entries are claimed first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Normal,
    High,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
        }
    }
}

/// Lifecycle of a queue entry: `queued → sending → {sent | queued | failed}`.
/// `sent`, `failed` and `cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Queued,
    Sending,
    Sent,
    Failed,
    Cancelled,
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryStatus::Queued => write!(f, "queued"),
            EntryStatus::Sending => write!(f, "sending"),
            EntryStatus::Sent => write!(f, "sent"),
            EntryStatus::Failed => write!(f, "failed"),
            EntryStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Campaign status. `processing` is held only while a scheduler run owns the campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Processing,
    Sent,
    Failed,
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CampaignStatus::Draft => write!(f, "draft"),
            CampaignStatus::Scheduled => write!(f, "scheduled"),
            CampaignStatus::Processing => write!(f, "processing"),
            CampaignStatus::Sent => write!(f, "sent"),
            CampaignStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One device address for a user on one provider.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeviceToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub platform: Platform,
    pub address_kind: AddressKind,
    pub address: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single delivery attempt record in the notification queue.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NotificationEntry {
    pub id: Uuid,
    pub recipient_id: Uuid,
    pub title: String,
    pub body: String,
    pub custom_data: serde_json::Value,
    pub category: NotificationCategory,
    pub source_type: SourceType,
    pub priority: Priority,
    pub context_id: Option<String>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub status: EntryStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub claim_token: Option<Uuid>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NotificationEntry {
    /// Rebuild the push payload carried by this entry.
    pub fn payload(&self) -> PushPayload {
        PushPayload {
            title: self.title.clone(),
            body: self.body.clone(),
            data: self.custom_data.clone(),
            context_id: self.context_id.clone(),
            priority: self.priority,
        }
    }
}

/// Who a campaign is sent to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TargetAudience {
    All,
    ByRole { role: String },
    ExplicitList { user_ids: Vec<Uuid> },
}

/// A broadcast scheduled for delivery to a resolved audience.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Campaign {
    pub id: Uuid,
    pub title: String,
    pub body: String,
    pub target_audience: sqlx::types::Json<TargetAudience>,
    pub status: CampaignStatus,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub successful_sends: i32,
    pub failed_sends: i32,
    pub error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Which users a rule targets when it fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleScope {
    /// Users with scheduled items due today that are not completed.
    IncompleteItemsToday,
    AllUsers,
    Role { role: String },
}

/// Typed representation of a rule's `trigger_conditions` JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerConditions {
    /// Local time of day the rule fires at, `HH:MM`.
    pub time_of_day: String,
    /// Offset of the rule's local time from UTC (default: 0).
    #[serde(default)]
    pub utc_offset_minutes: i32,
    /// Minutes either side of `time_of_day` during which the rule may fire (default: 5).
    pub tolerance_minutes: Option<u32>,
    pub scope: RuleScope,
}

/// A time-based rule that enqueues notifications once per day.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AutomatedRule {
    pub id: Uuid,
    pub rule_type: String,
    pub title: String,
    pub body: String,
    pub trigger_conditions: sqlx::types::Json<TriggerConditions>,
    pub is_active: bool,
    pub last_fired_on: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
}

/// Presence signal for a user in a conversation context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub user_id: Uuid,
    pub context_id: String,
    pub active: bool,
    pub last_seen: DateTime<Utc>,
}

/// Content handed to provider adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushPayload {
    pub title: String,
    pub body: String,
    /// Arbitrary key/value data forwarded to the client app.
    #[serde(default = "empty_object")]
    pub data: serde_json::Value,
    /// Conversation the notification belongs to, used for presence checks.
    #[serde(default)]
    pub context_id: Option<String>,
    #[serde(default)]
    pub priority: Priority,
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}
