pub mod annotation;
pub mod project;
pub mod video;

pub use annotation::Entity as Annotation;
pub use project::Entity as Project;
pub use video::Entity as Video;
