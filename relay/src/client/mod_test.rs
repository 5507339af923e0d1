use super::*;
use crate::config::RelayConfig;
use crate::hub::HubHandle;
use crate::test_support::{FakeBoard, OP_IGNORE, OP_REFUSE, card, eventually, free_port, spawn_hub, test_config};
use frames::protocol::{BoardEvent, BoardOperation};
use serde_json::json;

fn client_for(hub: &HubHandle, config: &RelayConfig) -> WorkspaceClient {
    let mut client_config = config.client();
    client_config.addr = hub.addr();
    WorkspaceClient::new(client_config)
}

async fn hub_with_board() -> (HubHandle, FakeBoard, RelayConfig) {
    let config = test_config(0, "client");
    let hub = spawn_hub(&config).await;
    let board = FakeBoard::connect(hub.addr(), "B1", "Demo", vec![card("B1", "a"), card("B1", "b")]).await;
    let state = hub.state().clone();
    eventually("board B1 connected", || {
        let state = state.clone();
        async move { state.boards.is_connected("B1").await }
    })
    .await;
    (hub, board, config)
}

#[tokio::test]
async fn queries_are_refused_before_registration() {
    let config = test_config(free_port().await, "idle");
    let client = WorkspaceClient::new(config.client());
    assert_eq!(client.state(), ClientState::Disconnected);
    let err = client.query("B1", "selectCard", vec![json!("a")]).await.expect_err("not registered");
    assert!(matches!(err, ClientError::NotRegistered));
}

#[tokio::test]
async fn connect_to_missing_hub_ends_in_error_state() {
    let config = test_config(free_port().await, "nohub");
    let client = WorkspaceClient::new(config.client());
    let mut events = client.subscribe();

    let err = client.connect().await.err().expect("no hub");
    assert!(matches!(err, ClientError::Connect { .. }));
    assert_eq!(client.state(), ClientState::Error);

    let mut saw_error = false;
    while let Ok(event) = events.try_recv() {
        saw_error |= matches!(event, ClientEvent::Error(_));
    }
    assert!(saw_error);
}

#[tokio::test]
async fn registration_loads_the_snapshot() {
    let (hub, _board, config) = hub_with_board().await;
    let client = client_for(&hub, &config);

    let _session = client.connect().await.expect("connect");
    assert_eq!(client.state(), ClientState::Registered);
    let replica = client.replica();
    assert_eq!(replica.board("B1").map(|b| b.cards.len()), Some(2));
    assert_eq!(client.connected_boards(), vec!["B1".to_owned()]);
    assert_eq!(hub.state().workspaces.workspaces().await.len(), 1);
    hub.shutdown().await;
}

#[tokio::test]
async fn relayed_query_reaches_the_board() {
    let (hub, mut board, config) = hub_with_board().await;
    let client = client_for(&hub, &config);
    let _session = client.connect().await.expect("connect");

    let selected: bool = client.query_as("B1", "selectCard", vec![json!("link-42")]).await.expect("query");
    assert!(selected);
    assert_eq!(board.next_query().await, BoardOperation::SelectCard("link-42".into()));
    hub.shutdown().await;
}

#[tokio::test]
async fn query_to_unknown_board_is_not_connected() {
    let (hub, _board, config) = hub_with_board().await;
    let client = client_for(&hub, &config);
    let _session = client.connect().await.expect("connect");

    let err = client.query("B2", "selectCard", vec![json!("link-42")]).await.expect_err("no board");
    assert!(matches!(err, ClientError::BoardNotConnected(ref id) if id == "B2"));
    hub.shutdown().await;
}

#[tokio::test]
async fn board_errors_and_bad_arguments_surface_as_remote_errors() {
    let (hub, _board, config) = hub_with_board().await;
    let client = client_for(&hub, &config);
    let _session = client.connect().await.expect("connect");

    let err = client.query("B1", OP_REFUSE, vec![]).await.expect_err("refused");
    assert!(matches!(err, ClientError::Remote { ref code, .. } if code == codes::BOARD_ERROR));

    let err = client.query("B1", "selectCard", vec![json!(42)]).await.expect_err("invalid");
    assert!(matches!(err, ClientError::Remote { ref code, .. } if code == codes::INVALID_ARGS));
    hub.shutdown().await;
}

#[tokio::test]
async fn silent_board_times_out_on_the_client_deadline() {
    let (hub, _board, mut config) = hub_with_board().await;
    config.client_timeout = Duration::from_millis(300);
    let mut client_config = config.client();
    client_config.addr = hub.addr();
    client_config.query_timeout = Duration::from_millis(300);
    let client = WorkspaceClient::new(client_config);
    let _session = client.connect().await.expect("connect");

    let err = client.query("B1", OP_IGNORE, vec![]).await.expect_err("timeout");
    assert!(matches!(err, ClientError::Timeout { .. }));

    // The connection is still usable afterwards.
    assert!(client.ping().await.expect("ping") > 0);
    hub.shutdown().await;
}

#[tokio::test]
async fn board_events_update_the_replica() {
    let (hub, board, config) = hub_with_board().await;
    let client = client_for(&hub, &config);
    let mut events = client.subscribe();
    let _session = client.connect().await.expect("connect");

    board.send_event(&BoardEvent::Card { canvas_link: "c".into(), card: Some(card("B1", "c")) });
    board.send_event(&BoardEvent::Card { canvas_link: "a".into(), card: None });

    eventually("replica reflects card changes", || {
        let client = client.clone();
        async move {
            let replica = client.replica();
            replica.card_by_link("c").is_some() && replica.card_by_link("a").is_none()
        }
    })
    .await;

    let mut saw_update = false;
    while let Ok(event) = events.try_recv() {
        saw_update |= matches!(event, ClientEvent::Hub(HubEvent::CardUpdate { .. }));
    }
    assert!(saw_update);
    hub.shutdown().await;
}

#[tokio::test]
async fn updates_to_one_card_arrive_in_order_without_coalescing() {
    const UPDATES: usize = 50;
    let (hub, board, config) = hub_with_board().await;
    let client = client_for(&hub, &config);
    let mut events = client.subscribe();
    let _session = client.connect().await.expect("connect");

    for i in 0..UPDATES {
        let mut update = card("B1", "z");
        update.title = format!("t{i}");
        board.send_event(&BoardEvent::Card { canvas_link: "z".into(), card: Some(update) });
    }

    let mut titles = Vec::new();
    while titles.len() < UPDATES {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("card update timed out")
            .expect("event stream open");
        if let ClientEvent::Hub(HubEvent::CardUpdate { canvas_link, card: Some(card), .. }) = event {
            if canvas_link == "z" {
                titles.push(card.title);
            }
        }
    }
    let expected: Vec<String> = (0..UPDATES).map(|i| format!("t{i}")).collect();
    assert_eq!(titles, expected);
    assert_eq!(client.replica().card_by_link("z").map(|c| c.title.clone()).as_deref(), Some("t49"));
    hub.shutdown().await;
}

#[tokio::test]
async fn requested_disconnect_is_reported_as_requested() {
    let (hub, _board, config) = hub_with_board().await;
    let client = client_for(&hub, &config);
    let session = client.connect().await.expect("connect");

    client.disconnect();
    assert_eq!(client.state(), ClientState::Disconnected);
    let reason = tokio::time::timeout(Duration::from_secs(2), session.wait()).await.expect("session ends");
    assert_eq!(reason, Disconnect::Requested);

    let err = client.query("B1", "cards", vec![]).await.expect_err("not registered");
    assert!(matches!(err, ClientError::NotRegistered));
    hub.shutdown().await;
}

#[tokio::test]
async fn hub_shutdown_is_reported_as_lost() {
    let (hub, _board, config) = hub_with_board().await;
    let client = client_for(&hub, &config);
    let session = client.connect().await.expect("connect");

    hub.shutdown().await;
    let reason = tokio::time::timeout(Duration::from_secs(2), session.wait()).await.expect("session ends");
    assert!(matches!(reason, Disconnect::Lost(_)));
    assert_eq!(client.state(), ClientState::Disconnected);
}
