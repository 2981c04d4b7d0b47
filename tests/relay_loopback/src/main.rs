fn main() {
    println!("Run `cargo test -p relay-loopback` to execute the relay end-to-end tests.");
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    use parley_client::{Client, ClientError};
    use parley_server::{RelayConfig, RelayError, RelayServer};
    use parley_storage::{FjallStore, MemoryStore, Storage};

    const WAIT: Duration = Duration::from_secs(5);

    /// A relay running on a loopback port for the duration of one test.
    struct Relay {
        addr: SocketAddr,
        cancel: CancellationToken,
        task: tokio::task::JoinHandle<Result<(), RelayError>>,
    }

    impl Relay {
        async fn start(storage: Arc<dyn Storage>) -> Self {
            let config = RelayConfig {
                bind: "127.0.0.1:0".parse().unwrap(),
                ..RelayConfig::default()
            };
            let server = RelayServer::bind(config, storage).await.unwrap();
            let addr = server.local_addr();
            let cancel = server.cancellation();
            let task = tokio::spawn(server.run());
            Self { addr, cancel, task }
        }

        async fn stop(self) {
            self.cancel.cancel();
            self.task.await.unwrap().unwrap();
        }
    }

    fn memory() -> Arc<dyn Storage> {
        Arc::new(MemoryStore::new())
    }

    #[tokio::test]
    async fn chat_flows_both_ways_between_two_users() {
        let relay = Relay::start(memory()).await;

        let mut alice = Client::connect(relay.addr, "alice").await.unwrap();
        let mut bob = Client::connect(relay.addr, "bob").await.unwrap();
        let mut to_alice = alice.take_incoming().unwrap();
        let mut to_bob = bob.take_incoming().unwrap();

        alice.send_chat("bob", "hello bob").await.unwrap();
        let chat = timeout(WAIT, to_bob.recv()).await.unwrap().unwrap();
        assert_eq!(chat.from, "alice");
        assert_eq!(chat.text, "hello bob");
        assert!(chat.time > 0.0);

        bob.send_chat("alice", "hi alice").await.unwrap();
        let chat = timeout(WAIT, to_alice.recv()).await.unwrap().unwrap();
        assert_eq!(chat.from, "bob");
        assert_eq!(chat.text, "hi alice");

        relay.stop().await;
    }

    #[tokio::test]
    async fn duplicate_name_is_refused_without_harming_the_original() {
        let relay = Relay::start(memory()).await;

        let alice = Client::connect(relay.addr, "alice").await.unwrap();
        match Client::connect(relay.addr, "alice").await {
            Err(ClientError::Refused(reason)) => assert_eq!(reason, "name already taken"),
            other => panic!("expected refusal, got {other:?}"),
        }

        // The first session keeps working.
        let users = alice.known_users().await.unwrap();
        assert_eq!(users, vec!["alice".to_string()]);

        relay.stop().await;
    }

    #[tokio::test]
    async fn contacts_roundtrip_with_unknown_names_refused() {
        let relay = Relay::start(memory()).await;

        let alice = Client::connect(relay.addr, "alice").await.unwrap();
        let _bob = Client::connect(relay.addr, "bob").await.unwrap();

        alice.add_contact("bob").await.unwrap();
        assert_eq!(alice.contacts().await.unwrap(), vec!["bob".to_string()]);

        match alice.add_contact("nobody").await {
            Err(ClientError::Refused(reason)) => assert_eq!(reason, "unknown user: nobody"),
            other => panic!("expected refusal, got {other:?}"),
        }

        alice.remove_contact("bob").await.unwrap();
        assert!(alice.contacts().await.unwrap().is_empty());

        relay.stop().await;
    }

    #[tokio::test]
    async fn exit_frees_the_name_but_the_directory_remembers() {
        let relay = Relay::start(memory()).await;

        let alice = Client::connect(relay.addr, "alice").await.unwrap();
        let bob = Client::connect(relay.addr, "bob").await.unwrap();
        alice.exit().await.unwrap();

        // The name is reusable at once and the departed user stays in
        // the directory.
        let alice_again = Client::connect(relay.addr, "alice").await.unwrap();
        let users = bob.known_users().await.unwrap();
        assert_eq!(users, vec!["alice".to_string(), "bob".to_string()]);

        drop(alice_again);
        relay.stop().await;
    }

    #[tokio::test]
    async fn chat_to_an_absent_user_is_dropped() {
        let relay = Relay::start(memory()).await;

        let alice = Client::connect(relay.addr, "alice").await.unwrap();
        alice.send_chat("bob", "anyone there?").await.unwrap();
        // Lockstep request as a barrier: once it answers, the chat frame
        // sent before it has been fully processed and discarded.
        alice.contacts().await.unwrap();

        let mut bob = Client::connect(relay.addr, "bob").await.unwrap();
        let mut incoming = bob.take_incoming().unwrap();
        assert!(
            timeout(Duration::from_millis(300), incoming.recv())
                .await
                .is_err(),
            "late registration must not resurrect a dropped chat"
        );

        relay.stop().await;
    }

    #[tokio::test]
    async fn directory_survives_a_relay_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn Storage> = Arc::new(FjallStore::open(Some(dir.path())).unwrap());

        let relay = Relay::start(store.clone()).await;
        let alice = Client::connect(relay.addr, "alice").await.unwrap();
        let bob = Client::connect(relay.addr, "bob").await.unwrap();
        alice.add_contact("bob").await.unwrap();
        drop(alice);
        drop(bob);
        relay.stop().await;

        let relay = Relay::start(store.clone()).await;
        let alice = Client::connect(relay.addr, "alice").await.unwrap();
        assert_eq!(alice.contacts().await.unwrap(), vec!["bob".to_string()]);
        assert_eq!(
            alice.known_users().await.unwrap(),
            vec!["alice".to_string(), "bob".to_string()]
        );
        relay.stop().await;
    }
}
