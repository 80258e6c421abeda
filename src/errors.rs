use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum AppError {
    #[error("Database error: {0}")]
    #[diagnostic(code(framemark::db))]
    Db(#[from] sea_orm::DbErr),
}
