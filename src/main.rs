use rocket::{Build, Rocket, launch};

#[launch]
fn rocket() -> Rocket<Build> {
    reply_server::rocket()
}
