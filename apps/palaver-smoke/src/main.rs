use std::env;

use client_matrix::{ClientConfig, Credentials, MatrixClient};

mod logging;

#[tokio::main]
async fn main() {
    logging::init();

    let config = match ClientConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Configuration error: {err}");
            eprintln!("Set PALAVER_HOMESERVER to run the live smoke.");
            std::process::exit(1);
        }
    };

    let client = MatrixClient::new(config).expect("client construction failed");
    let mut notices = client.subscribe();

    let maybe_user = env::var("PALAVER_USER").ok();
    let maybe_token = env::var("PALAVER_TOKEN").ok();
    let maybe_password = env::var("PALAVER_PASSWORD").ok();

    match (maybe_user, maybe_token, maybe_password) {
        (Some(user), Some(token), _) => {
            client
                .login_with_token(&user, &token)
                .await
                .expect("live token login failed");
            println!("Logged in as {user}; streaming. Ctrl-C to stop.");
        }
        (Some(user), None, Some(password)) => {
            client
                .login(Credentials::password(&user, &password))
                .await
                .expect("live password login failed");
            println!("Logged in as {user}; streaming. Ctrl-C to stop.");
        }
        _ => {
            println!("Set PALAVER_USER plus PALAVER_TOKEN or PALAVER_PASSWORD to run live auth smoke.");
            return;
        }
    }

    for room in client.rooms() {
        println!(
            "room {} name={:?} members={}",
            room.room_id(),
            room.name(),
            room.members().len()
        );
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            notice = notices.recv() => match notice {
                Ok(notice) => println!("{notice:?}"),
                Err(err) => {
                    eprintln!("notice stream ended: {err}");
                    break;
                }
            },
        }
    }

    client.stop().await;
}
