use crate::ipc::error::{err, ok};
use crate::ipc::types::{Actor, AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

struct UserRow {
    id: String,
    name: String,
    email: Option<String>,
    team_id: Option<String>,
    division_id: Option<String>,
}

fn load_user(conn: &Connection, user_id: &str) -> Result<Option<UserRow>, HandlerErr> {
    conn.query_row(
        "SELECT u.id, u.name, u.email, u.team_id, t.division_id
         FROM users u
         LEFT JOIN teams t ON t.id = u.team_id
         WHERE u.id = ?",
        [user_id],
        |r| {
            Ok(UserRow {
                id: r.get(0)?,
                name: r.get(1)?,
                email: r.get(2)?,
                team_id: r.get(3)?,
                division_id: r.get(4)?,
            })
        },
    )
    .optional()
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn user_json(user: &UserRow) -> serde_json::Value {
    json!({
        "id": user.id,
        "name": user.name,
        "email": user.email,
        "teamId": user.team_id,
        "divisionId": user.division_id
    })
}

fn handle_session_sign_in(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let user_id = match req.params.get("userId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing userId", None),
    };

    let user = match load_user(conn, &user_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(user) = user else {
        return err(&req.id, "not_found", "user not found", None);
    };

    let payload = user_json(&user);
    state.actor = Some(Actor {
        id: user.id,
        name: user.name,
    });
    ok(&req.id, json!({ "user": payload }))
}

fn handle_session_current(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(actor) = state.actor.as_ref() else {
        return ok(&req.id, json!({ "user": null }));
    };
    match load_user(conn, &actor.id) {
        Ok(Some(user)) => ok(&req.id, json!({ "user": user_json(&user) })),
        Ok(None) => ok(&req.id, json!({ "user": null })),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "session.signIn" => Some(handle_session_sign_in(state, req)),
        "session.current" => Some(handle_session_current(state, req)),
        _ => None,
    }
}
