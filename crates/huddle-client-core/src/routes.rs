//! Backend routes consumed by the client.

pub const REFRESH_PATH: &str = "/auth/refresh";
pub const ENTITIES_PATH: &str = "/entities";

#[must_use]
pub fn entity_path(entity_id: &str) -> String {
    format!("{ENTITIES_PATH}/{}", entity_id.trim())
}

#[must_use]
pub fn entity_participants_path(entity_id: &str) -> String {
    format!("{ENTITIES_PATH}/{}/participants", entity_id.trim())
}

#[must_use]
pub fn entity_join_path(entity_id: &str) -> String {
    format!("{ENTITIES_PATH}/{}/join", entity_id.trim())
}

#[must_use]
pub fn entity_leave_path(entity_id: &str) -> String {
    format!("{ENTITIES_PATH}/{}/leave", entity_id.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_helpers_are_deterministic() {
        assert_eq!(entity_path(" ent_1 "), "/entities/ent_1");
        assert_eq!(
            entity_participants_path("ent_1"),
            "/entities/ent_1/participants"
        );
        assert_eq!(entity_join_path("ent_1"), "/entities/ent_1/join");
        assert_eq!(entity_leave_path("ent_1"), "/entities/ent_1/leave");
    }
}
