//! Users, roles and user administration

mod admin;
mod model;
mod repository;

pub use admin::{Invitation, UserAdmin, INVITATION_PATH};
pub use model::{Role, RoleSet, User, UserId};
pub use repository::{NewUser, PgUserRepository, UserDirectory, UserStore};

#[cfg(test)]
pub use repository::{MockUserDirectory, MockUserStore};
