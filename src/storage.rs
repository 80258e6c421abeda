use crate::entities;
use crate::errors::AppError;
use crate::settings::Database as DbCfg;
use base64ct::Encoding;
use chrono::Utc;
use rand::RngCore;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, Database, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, Schema, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i32,
    pub sub: String,
    pub title: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Video {
    pub id: String,
    pub project_id: i32,
    pub filename: String,
    pub created_at: i64,
}

/// Annotation payload as submitted by clients, before an id is assigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAnnotation {
    pub timestamp: f64,
    pub points: Value,
    pub image_url: String,
}

pub async fn init(cfg: &DbCfg) -> Result<DatabaseConnection, AppError> {
    let db = Database::connect(&cfg.url).await?;
    create_tables(&db).await?;
    Ok(db)
}

/// Create all tables if they do not exist yet. Schema changes beyond adding
/// tables still require manual migration.
pub async fn create_tables(db: &DatabaseConnection) -> Result<(), AppError> {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);

    let mut stmt = schema.create_table_from_entity(entities::Project);
    db.execute(backend.build(stmt.if_not_exists())).await?;
    let mut stmt = schema.create_table_from_entity(entities::Video);
    db.execute(backend.build(stmt.if_not_exists())).await?;
    let mut stmt = schema.create_table_from_entity(entities::Annotation);
    db.execute(backend.build(stmt.if_not_exists())).await?;
    Ok(())
}

pub async fn create_project(
    db: &DatabaseConnection,
    sub: &str,
    title: &str,
    description: &str,
) -> Result<Project, AppError> {
    let row = entities::project::ActiveModel {
        sub: Set(sub.to_string()),
        title: Set(title.to_string()),
        description: Set(description.to_string()),
        ..Default::default()
    };
    let model = row.insert(db).await?;
    Ok(Project {
        id: model.id,
        sub: model.sub,
        title: model.title,
        description: model.description,
    })
}

pub async fn list_projects(db: &DatabaseConnection, sub: &str) -> Result<Vec<Project>, AppError> {
    use entities::project::Column;

    let rows = entities::Project::find()
        .filter(Column::Sub.eq(sub))
        .order_by_asc(Column::Id)
        .all(db)
        .await?;
    Ok(rows
        .into_iter()
        .map(|m| Project {
            id: m.id,
            sub: m.sub,
            title: m.title,
            description: m.description,
        })
        .collect())
}

/// Look up a project by id, scoped to its owner. Returns `None` both when the
/// id is unknown and when the project belongs to someone else.
pub async fn find_project(
    db: &DatabaseConnection,
    id: i32,
    sub: &str,
) -> Result<Option<Project>, AppError> {
    use entities::project::Column;

    let row = entities::Project::find()
        .filter(Column::Id.eq(id))
        .filter(Column::Sub.eq(sub))
        .one(db)
        .await?;
    Ok(row.map(|m| Project {
        id: m.id,
        sub: m.sub,
        title: m.title,
        description: m.description,
    }))
}

/// Delete a project scoped to its owner. Returns whether a row was deleted.
pub async fn delete_project(db: &DatabaseConnection, id: i32, sub: &str) -> Result<bool, AppError> {
    use entities::project::Column;

    let res = entities::Project::delete_many()
        .filter(Column::Id.eq(id))
        .filter(Column::Sub.eq(sub))
        .exec(db)
        .await?;
    Ok(res.rows_affected > 0)
}

pub async fn create_video(
    db: &DatabaseConnection,
    project_id: i32,
    filename: &str,
) -> Result<Video, AppError> {
    let id = random_id();
    let created_at = Utc::now().timestamp();

    let row = entities::video::ActiveModel {
        id: Set(id.clone()),
        project_id: Set(project_id),
        filename: Set(filename.to_string()),
        created_at: Set(created_at),
    };
    row.insert(db).await?;

    Ok(Video {
        id,
        project_id,
        filename: filename.to_string(),
        created_at,
    })
}

/// Delete a video record. Returns whether a row was deleted.
pub async fn delete_video(db: &DatabaseConnection, id: &str) -> Result<bool, AppError> {
    let res = entities::Video::delete_by_id(id.to_string()).exec(db).await?;
    Ok(res.rows_affected > 0)
}

/// Insert a batch of annotations atomically. Either every row lands or, on
/// any failure, none do.
pub async fn insert_annotations(
    db: &DatabaseConnection,
    project_id: i32,
    items: &[NewAnnotation],
) -> Result<usize, AppError> {
    let txn = db.begin().await?;
    for item in items {
        let row = entities::annotation::ActiveModel {
            id: Set(random_id()),
            project_id: Set(project_id),
            timestamp: Set(item.timestamp),
            points: Set(item.points.clone()),
            image_url: Set(item.image_url.clone()),
        };
        row.insert(&txn).await?;
    }
    txn.commit().await?;
    Ok(items.len())
}

pub async fn count_annotations(db: &DatabaseConnection, project_id: i32) -> Result<u64, AppError> {
    use entities::annotation::Column;

    let count = entities::Annotation::find()
        .filter(Column::ProjectId.eq(project_id))
        .count(db)
        .await?;
    Ok(count)
}

pub fn random_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64ct::Base64UrlUnpadded::encode_string(&bytes)
}
