/// Errors that can occur while scheduling a job.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    /// An error occurred while inserting the job into the database.
    #[error(transparent)]
    DatabaseError(#[from] sqlx::Error),
}
