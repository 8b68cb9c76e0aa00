//! SeaORM entity models used by the database storage backend.
//!
//! These structs map to the SQLite tables created by `database_storage`:
//! - `participants`: one row per registered participant
//! - `recordings`: one row per `(participant, task)` holding the media payloads
//! - `submissions`: JSON-serialized final submission per participant

use sea_orm::entity::prelude::*;

/// Participants table entity model.
///
/// Timestamps are stored as RFC3339 strings, which keeps them sortable.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "participants")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub created_at: String,
    /// Client IP address as text
    pub client_ip: Option<String>,
    pub submitted_at: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl Related<self::recordings::Entity> for Entity {
    fn to() -> RelationDef {
        self::recordings::Relation::Participant.def()
    }
}

impl Related<self::submissions::Entity> for Entity {
    fn to() -> RelationDef {
        self::submissions::Relation::Participant.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Recordings table entity models.
pub mod recordings {
    use sea_orm::entity::prelude::*;

    /// Task recording keyed by `(participant_id, task_number)`.
    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "recordings")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub participant_id: String,
        #[sea_orm(primary_key, auto_increment = false)]
        pub task_number: i32,
        pub screen_data: Option<Vec<u8>>,
        pub audio_data: Option<Vec<u8>>,
        pub transcript: Option<String>,
        pub duration_ms: i64,
        pub recorded_at: String,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {
        #[sea_orm(
            belongs_to = "super::Entity",
            from = "Column::ParticipantId",
            to = "super::Column::Id"
        )]
        Participant,
    }

    impl ActiveModelBehavior for ActiveModel {}
}

/// Submissions table entity models.
pub mod submissions {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "submissions")]
    pub struct Model {
        /// Primary key and FK to `participants.id`
        #[sea_orm(primary_key, auto_increment = false)]
        pub participant_id: String,
        pub json: String,
        pub submitted_at: String,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {
        #[sea_orm(
            belongs_to = "super::Entity",
            from = "Column::ParticipantId",
            to = "super::Column::Id"
        )]
        Participant,
    }

    impl ActiveModelBehavior for ActiveModel {}
}
