use std::io::Read;
use std::net::{SocketAddr, TcpListener};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{sleep, spawn, JoinHandle};
use std::time::Duration;

use dicomnet_ul::association::server::AcceptError;
use dicomnet_ul::association::{Error, ReleaseOutcome};
use dicomnet_ul::pdu::{
    AbortRQServiceProviderReason, AbortRQSource, AssociationAC, AssociationRJServiceUserReason, AssociationRJSource,
    PDataValueType, PresentationContextNegotiated, PresentationContextResult,
    PresentationContextResultReason, UserVariableItem,
};
use dicomnet_ul::{
    read_pdu, write_pdu, AssociationListener, AssociationReader, AssociationState,
    ClientAssociationOptions, CloseReason, NegotiationError, Pdu, ServerAssociationOptions,
    StateTransition,
};
use matches::assert_matches;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

static SCU_AE_TITLE: &str = "ECHO-SCU";
static SCP_AE_TITLE: &str = "ECHO-SCP";

static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
static EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";
static JPEG_BASELINE: &str = "1.2.840.10008.1.2.4.50";
static VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";
static DIGITAL_MG_STORAGE_SOP_CLASS: &str = "1.2.840.10008.5.1.4.1.1.1.2";

/// Drain every incoming message until the association closes.
fn drain(mut reader: AssociationReader) -> JoinHandle<Vec<(PDataValueType, usize)>> {
    spawn(move || {
        let mut seen = Vec::new();
        while let Ok(Some(message)) = reader.next_message() {
            seen.push((message.value_type, message.data.len()));
        }
        seen
    })
}

fn recording_listener() -> (Arc<dyn AssociationListener>, Arc<Mutex<Vec<StateTransition>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let listener: Arc<dyn AssociationListener> =
        Arc::new(move |t: &StateTransition| sink.lock().unwrap().push(t.clone()));
    (listener, seen)
}

/// An acceptor answering each message with a smaller one,
/// until the requester releases the association.
fn spawn_scp() -> Result<(JoinHandle<Result<Vec<usize>>>, SocketAddr)> {
    let listener = TcpListener::bind("localhost:0")?;
    let addr = listener.local_addr()?;
    let scp = ServerAssociationOptions::new()
        .accept_called_ae_title()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .with_transfer_syntax(IMPLICIT_VR_LE);

    let h = spawn(move || -> Result<Vec<usize>> {
        let (stream, _addr) = listener.accept()?;
        let (association, mut reader) = scp.establish(stream)?;

        assert_eq!(association.peer_ae_title(), SCU_AE_TITLE);
        assert_eq!(
            association.presentation_contexts(),
            &[
                PresentationContextNegotiated {
                    id: 1,
                    reason: PresentationContextResultReason::Acceptance,
                    abstract_syntax: VERIFICATION_SOP_CLASS.to_string(),
                    transfer_syntax: IMPLICIT_VR_LE.to_string(),
                },
                PresentationContextNegotiated {
                    id: 3,
                    reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                    abstract_syntax: DIGITAL_MG_STORAGE_SOP_CLASS.to_string(),
                    transfer_syntax: IMPLICIT_VR_LE.to_string(),
                },
            ],
        );
        assert_eq!(
            association.peer_implementation_class_uid(),
            Some(dicomnet_ul::IMPLEMENTATION_CLASS_UID)
        );

        let mut sizes = Vec::new();
        while let Some(message) = reader.next_message()? {
            sizes.push(message.data.len());
            if message.value_type == PDataValueType::Data {
                association.send_message(message.presentation_context_id, &[0; 8], None)?;
            }
        }
        assert_eq!(association.close_reason(), Some(CloseReason::Released));
        Ok(sizes)
    });
    Ok((h, addr))
}

#[test]
fn scu_scp_exchange_and_release() {
    let (scp_handle, scp_addr) = spawn_scp().unwrap();
    let (listener, transitions) = recording_listener();

    let (association, reader) = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_presentation_context(VERIFICATION_SOP_CLASS, vec![EXPLICIT_VR_LE, IMPLICIT_VR_LE])
        .with_presentation_context(
            DIGITAL_MG_STORAGE_SOP_CLASS,
            vec![IMPLICIT_VR_LE, EXPLICIT_VR_LE, JPEG_BASELINE],
        )
        .with_listener(listener)
        .establish(scp_addr)
        .unwrap();

    assert_eq!(association.state(), AssociationState::Open);
    assert_eq!(association.accepted_transfer_syntax(1), Some(IMPLICIT_VR_LE));
    assert_eq!(association.accepted_transfer_syntax(3), None);
    let receiver = drain(reader);

    // a data set spanning several PDUs
    association
        .send_message(1, &[1; 100], Some(&vec![2; 40_000]))
        .unwrap();

    // the rejected context is refused before anything is sent
    assert_matches!(
        association.send_message(3, &[1; 100], None),
        Err(Error::ContextNotAccepted {
            presentation_context_id: 3,
            ..
        })
    );

    assert_eq!(association.release(true).unwrap(), ReleaseOutcome::Acknowledged);
    assert_eq!(association.state(), AssociationState::Closed);
    assert_eq!(association.release(true).unwrap(), ReleaseOutcome::AlreadyClosed);

    let received = receiver.join().unwrap();
    assert_eq!(received, vec![(PDataValueType::Command, 8)]);

    let sizes = scp_handle
        .join()
        .expect("SCP panicked")
        .expect("Error at the SCP");
    assert_eq!(sizes, vec![100, 40_000]);

    let states: Vec<_> = transitions
        .lock()
        .unwrap()
        .iter()
        .map(|t| (t.from, t.to))
        .collect();
    assert_eq!(
        states,
        vec![
            (AssociationState::Idle, AssociationState::Requesting),
            (AssociationState::Requesting, AssociationState::Open),
            (AssociationState::Open, AssociationState::Releasing),
            (AssociationState::Releasing, AssociationState::Closed),
        ]
    );
}

#[test]
fn scp_rejects_wrong_called_ae_title() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = ServerAssociationOptions::new()
        .accept_called_ae_title()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS);

    let h = spawn(move || {
        let (stream, _addr) = listener.accept().unwrap();
        scp.establish(stream).map(|_| ())
    });

    let err = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title("SOMEONE-ELSE")
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .establish(addr)
        .unwrap_err();

    match err {
        NegotiationError::Rejected { association_rj, .. } => assert_eq!(
            association_rj.source,
            AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CalledAeTitleNotRecognized
            )
        ),
        e => panic!("expected rejection, got {:?}", e),
    }
    assert_matches!(h.join().unwrap(), Err(AcceptError::Rejected { .. }));
}

#[test]
fn silent_acceptor_times_out() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let h = spawn(move || {
        let (mut stream, _addr) = listener.accept().unwrap();
        // never answer, just wait for the requester to hang up
        let mut sink = Vec::new();
        let _ = stream.read_to_end(&mut sink);
    });

    let (listener, transitions) = recording_listener();
    let err = ClientAssociationOptions::new()
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .accept_timeout(Duration::from_millis(200))
        .with_listener(listener)
        .establish(addr)
        .unwrap_err();

    assert_matches!(err, NegotiationError::Timeout { .. });
    h.join().unwrap();

    let transitions = transitions.lock().unwrap();
    assert_eq!(transitions.len(), 2);
    assert_matches!(
        transitions[1].reason,
        Some(CloseReason::NegotiationFailed(_))
    );
}

/// Answer the first association request with a fixed set of results.
fn spawn_raw_acceptor(
    results: Vec<PresentationContextResult>,
) -> (JoinHandle<()>, SocketAddr) {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let h = spawn(move || {
        let (mut stream, _addr) = listener.accept().unwrap();
        let rq = match read_pdu(&mut stream, 16_384, true).unwrap() {
            Pdu::AssociationRQ(rq) => rq,
            pdu => panic!("unexpected PDU {:?}", pdu),
        };
        let ac = Pdu::AssociationAC(AssociationAC {
            protocol_version: 1,
            calling_ae_title: rq.calling_ae_title,
            called_ae_title: rq.called_ae_title,
            application_context_name: rq.application_context_name,
            presentation_contexts: results,
            user_variables: vec![UserVariableItem::MaxLength(0)],
        });
        write_pdu(&mut stream, &ac).unwrap();
        // wait for the requester to hang up
        let mut sink = Vec::new();
        let _ = stream.read_to_end(&mut sink);
    });
    (h, addr)
}

#[test]
fn substituted_transfer_syntax_is_exposed() {
    let (h, addr) = spawn_raw_acceptor(vec![PresentationContextResult {
        id: 1,
        reason: PresentationContextResultReason::Acceptance,
        transfer_syntax: IMPLICIT_VR_LE.to_string(),
    }]);

    let (association, reader) = ClientAssociationOptions::new()
        .with_presentation_context(VERIFICATION_SOP_CLASS, vec![EXPLICIT_VR_LE, IMPLICIT_VR_LE])
        .establish(addr)
        .unwrap();
    let receiver = drain(reader);

    assert_eq!(association.accepted_transfer_syntax(1), Some(IMPLICIT_VR_LE));
    assert_eq!(
        association.peer_max_pdu_length(),
        dicomnet_ul::pdu::MAXIMUM_PDU_SIZE
    );
    assert!(association.require_context(1, Some(IMPLICIT_VR_LE)).is_ok());
    assert_matches!(
        association.require_context(1, Some(EXPLICIT_VR_LE)),
        Err(Error::ContextNotAccepted { .. })
    );

    association.abort(AbortRQSource::ServiceUser);
    assert_eq!(
        association.close_reason(),
        Some(CloseReason::Aborted(AbortRQSource::ServiceUser))
    );
    assert!(association.wait_closed(Duration::from_secs(1)));
    receiver.join().unwrap();
    h.join().unwrap();
}

#[test]
fn unproposed_transfer_syntax_is_not_accepted() {
    let (h, addr) = spawn_raw_acceptor(vec![PresentationContextResult {
        id: 1,
        reason: PresentationContextResultReason::Acceptance,
        transfer_syntax: JPEG_BASELINE.to_string(),
    }]);

    let err = ClientAssociationOptions::new()
        .with_presentation_context(VERIFICATION_SOP_CLASS, vec![IMPLICIT_VR_LE])
        .establish(addr)
        .unwrap_err();
    assert_matches!(err, NegotiationError::NoAcceptedPresentationContexts { .. });
    h.join().unwrap();
}

#[test]
fn peer_abort_closes_the_acceptor() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = ServerAssociationOptions::new()
        .promiscuous(true)
        .request_timeout(Duration::from_secs(5));

    let h = spawn(move || {
        let (stream, _addr) = listener.accept().unwrap();
        let (association, mut reader) = scp.establish(stream).unwrap();
        assert_matches!(reader.next_message(), Ok(None));
        association.close_reason()
    });

    let (association, _reader) = ClientAssociationOptions::new()
        .with_abstract_syntax(DIGITAL_MG_STORAGE_SOP_CLASS)
        .establish(addr)
        .unwrap();
    association.abort(AbortRQSource::ServiceUser);
    assert_eq!(association.state(), AssociationState::Closed);

    assert_eq!(
        h.join().unwrap(),
        Some(CloseReason::Aborted(AbortRQSource::ServiceUser))
    );
}

#[test]
fn abort_does_not_wait_for_a_blocked_write() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = ServerAssociationOptions::new().promiscuous(true);
    let (hang_up, wait_hang_up) = mpsc::channel::<()>();

    // accept, then never read anything
    let h = spawn(move || {
        let (stream, _addr) = listener.accept().unwrap();
        let (_association, _reader) = scp.establish(stream).unwrap();
        let _ = wait_hang_up.recv();
    });

    let (association, reader) = ClientAssociationOptions::new()
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .establish(addr)
        .unwrap();
    let receiver = drain(reader);

    let sender = {
        let association = Arc::clone(&association);
        spawn(move || association.send_message(1, &[1; 64], Some(&vec![0; 32 << 20])))
    };
    // let the socket buffers fill up
    sleep(Duration::from_millis(500));

    let (done, aborted) = mpsc::channel();
    {
        let association = Arc::clone(&association);
        spawn(move || {
            association.abort(AbortRQSource::ServiceUser);
            let _ = done.send(());
        });
    }
    assert!(aborted.recv_timeout(Duration::from_secs(5)).is_ok());
    assert_eq!(association.state(), AssociationState::Closed);
    assert_eq!(
        association.close_reason(),
        Some(CloseReason::Aborted(AbortRQSource::ServiceUser))
    );

    assert!(sender.join().unwrap().is_err());
    receiver.join().unwrap();
    hang_up.send(()).unwrap();
    h.join().unwrap();
}

#[test]
fn oversized_message_aborts_the_association() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = ServerAssociationOptions::new()
        .promiscuous(true)
        .max_message_length(1024)
        .request_timeout(Duration::from_secs(5));

    let h = spawn(move || {
        let (stream, _addr) = listener.accept().unwrap();
        let (association, mut reader) = scp.establish(stream).unwrap();
        // the command fits, the data set does not
        let outcome = loop {
            match reader.next_message() {
                Ok(Some(_)) => continue,
                other => break other,
            }
        };
        (outcome, association.close_reason())
    });

    let (association, reader) = ClientAssociationOptions::new()
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .establish(addr)
        .unwrap();
    let receiver = drain(reader);
    association
        .send_message(1, &[1; 64], Some(&[0u8; 4096][..]))
        .unwrap();

    let (outcome, close_reason) = h.join().unwrap();
    assert_matches!(outcome, Err(Error::Fragments { .. }));
    let provider_abort = Some(CloseReason::Aborted(AbortRQSource::ServiceProvider(
        AbortRQServiceProviderReason::InvalidPduParameter,
    )));
    assert_eq!(close_reason, provider_abort);

    receiver.join().unwrap();
    assert_eq!(association.state(), AssociationState::Closed);
    assert_eq!(association.close_reason(), provider_abort);
}
