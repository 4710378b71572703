//! End-to-end protocol tests over several simulated nodes.

use nalgebra::Vector3;
use patchwork_core::{AtomId, ComputeKind, FullAtom, PatchConfig, PatchId};
use patchwork_env::NodeId;
use patchwork_sim::{SimConfig, SimError, SimWorld};
use proptest::prelude::*;

fn two_patch_config() -> SimConfig {
    SimConfig::default()
        .with_layout(2, 1)
        .with_dims([2, 1, 1])
        .with_cell([20.0, 10.0, 10.0], [true; 3])
}

fn moving_atom(id: u64, position: [f64; 3], velocity: [f64; 3]) -> FullAtom {
    FullAtom::new(AtomId(id), Vector3::from(position)).with_velocity(Vector3::from(velocity))
}

fn assert_same_trajectory(a: &[FullAtom], b: &[FullAtom]) {
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b) {
        assert_eq!(x.id, y.id);
        for axis in 0..3 {
            approx::assert_abs_diff_eq!(x.position[axis], y.position[axis], epsilon = 1e-9);
            approx::assert_abs_diff_eq!(x.velocity[axis], y.velocity[axis], epsilon = 1e-9);
        }
    }
}

#[tokio::test]
async fn test_atoms_conserved_and_inside_their_patch() {
    let mut world = SimWorld::new(SimConfig::default().with_atoms(120)).unwrap();
    world.setup().await.unwrap();

    for _ in 0..8 {
        let report = world.step().await.unwrap();
        assert_eq!(report.atoms, 120);
        for node in world.nodes() {
            for home in node.home_patches() {
                for atom in home.atoms() {
                    let s = home.lattice().scale(&atom.position);
                    assert!(home.extents().contains(&s), "{} outside {}", atom.id, home.id());
                }
            }
        }
    }
}

#[tokio::test]
async fn test_two_patch_crossing() {
    let atom = moving_atom(0, [9.8, 5.0, 5.0], [0.5, 0.0, 0.0]);
    let mut world = SimWorld::with_atoms(two_patch_config(), vec![atom]).unwrap();
    world.setup().await.unwrap();
    assert_eq!(world.owner_of(AtomId(0)), Some(PatchId(0)));

    let report = world.step().await.unwrap();
    assert_eq!(report.migrated, 1);
    assert_eq!(world.owner_of(AtomId(0)), Some(PatchId(1)));
    approx::assert_abs_diff_eq!(world.atoms()[0].position.x, 10.3, epsilon = 1e-12);
    assert_eq!(world.node(NodeId(1)).unwrap().num_atoms(), 1);
    assert_eq!(world.node(NodeId(0)).unwrap().num_atoms(), 0);
}

#[tokio::test]
async fn test_non_periodic_face_keeps_atom() {
    let config = two_patch_config().with_cell([20.0, 10.0, 10.0], [false, true, true]);
    let atom = moving_atom(0, [19.8, 5.0, 5.0], [0.5, 0.0, 0.0]);
    let mut world = SimWorld::with_atoms(config, vec![atom]).unwrap();
    world.setup().await.unwrap();
    world.step().await.unwrap();

    assert_eq!(world.owner_of(AtomId(0)), Some(PatchId(1)));
    approx::assert_abs_diff_eq!(world.atoms()[0].position.x, 20.3, epsilon = 1e-12);
}

#[tokio::test]
async fn test_migration_period_defers_handoff() {
    let patch = PatchConfig {
        migration_period: 2,
        ..PatchConfig::default()
    };
    let atom = moving_atom(0, [9.8, 5.0, 5.0], [0.5, 0.0, 0.0]);
    let mut world = SimWorld::with_atoms(two_patch_config().with_patch_config(patch), vec![atom]).unwrap();
    world.setup().await.unwrap();

    // Step 0 does not migrate: the atom is past the face but still in P0
    world.step().await.unwrap();
    assert_eq!(world.owner_of(AtomId(0)), Some(PatchId(0)));

    world.step().await.unwrap();
    assert_eq!(world.owner_of(AtomId(0)), Some(PatchId(1)));
    approx::assert_abs_diff_eq!(world.atoms()[0].position.x, 10.8, epsilon = 1e-12);
}

#[tokio::test]
async fn test_margin_violations_without_migration() {
    let patch = PatchConfig {
        migration_period: 0,
        ..PatchConfig::default()
    };
    let atom = moving_atom(0, [9.8, 5.0, 5.0], [1.0, 0.0, 0.0]);
    let mut world = SimWorld::with_atoms(two_patch_config().with_patch_config(patch), vec![atom]).unwrap();
    world.setup().await.unwrap();

    let report = world.step().await.unwrap();
    assert_eq!(report.margin_violations, 1);
    assert_eq!(report.migrated, 0);
    assert_eq!(world.owner_of(AtomId(0)), Some(PatchId(0)));
}

#[tokio::test]
async fn test_same_seed_same_run() {
    let config = SimConfig::default().with_seed(9).with_atoms(80);
    let mut a = SimWorld::new(config.clone()).unwrap();
    let mut b = SimWorld::new(config).unwrap();
    a.setup().await.unwrap();
    b.setup().await.unwrap();

    let ra = a.run(5).await.unwrap();
    let rb = b.run(5).await.unwrap();
    assert_eq!(ra, rb);
    assert_eq!(a.atoms(), b.atoms());
}

#[tokio::test]
async fn test_relocation_matches_unmoved_run() {
    let config = SimConfig::default().with_seed(3).with_atoms(150);
    let mut reference = SimWorld::new(config.clone()).unwrap();
    let mut moved = SimWorld::new(config).unwrap();
    reference.setup().await.unwrap();
    moved.setup().await.unwrap();

    reference.run(3).await.unwrap();
    moved.run(3).await.unwrap();

    let cid = moved
        .simulation()
        .compute_map
        .read()
        .find(ComputeKind::NonbondedPair, &[PatchId(0), PatchId(1)])
        .unwrap();
    assert_eq!(moved.simulation().compute_map.read().node(cid).unwrap(), NodeId(0));
    moved.relocate(cid, NodeId(3)).await.unwrap();

    let record = moved.simulation().compute_map.read().record(cid).unwrap().clone();
    assert_eq!(record.node, NodeId(3));
    assert_eq!(record.move_to, None);
    let target = moved.node(NodeId(3)).unwrap();
    assert!(target.computes().contains(cid));
    assert!(target.proxies().contains(PatchId(0)));
    assert!(target.proxies().contains(PatchId(1)));
    assert!(!moved.node(NodeId(0)).unwrap().computes().contains(cid));

    reference.run(4).await.unwrap();
    moved.run(4).await.unwrap();
    assert_same_trajectory(&reference.atoms(), &moved.atoms());

    // The new proxies are part of the homes' trees
    for node in moved.nodes() {
        for home in node.home_patches() {
            home.tree().validate(home.proxies()).unwrap();
        }
    }
    let home = moved.node(NodeId(0)).unwrap().home_patch(PatchId(0)).unwrap();
    assert!(home.proxies().contains(&NodeId(3)));
    assert!(home.tree().contains(NodeId(3)));
}

#[tokio::test]
async fn test_relocating_unknown_compute_fails() {
    let mut world = SimWorld::new(SimConfig::default().with_atoms(10)).unwrap();
    world.setup().await.unwrap();
    let err = world
        .relocate(patchwork_core::ComputeId(100_000), NodeId(1))
        .await
        .unwrap_err();
    assert!(matches!(err, SimError::Patch(_)));
}

#[tokio::test]
async fn test_relocation_to_missing_node_is_cancelled() {
    let mut world = SimWorld::new(SimConfig::default().with_seed(5).with_atoms(60)).unwrap();
    world.setup().await.unwrap();
    world.run(1).await.unwrap();

    let cid = world
        .simulation()
        .compute_map
        .read()
        .find(ComputeKind::NonbondedPair, &[PatchId(0), PatchId(1)])
        .unwrap();
    let err = world.relocate(cid, NodeId(99)).await.unwrap_err();
    assert!(matches!(err, SimError::Env(_)));

    let record = world.simulation().compute_map.read().record(cid).unwrap().clone();
    assert_eq!(record.node, NodeId(0));
    assert_eq!(record.move_to, None);
    assert!(world.simulation().compute_map.read().pending_moves().is_empty());
    assert!(world.node(NodeId(0)).unwrap().computes().contains(cid));

    let report = world.step().await.unwrap();
    assert_eq!(report.atoms, 60);
}

#[tokio::test]
async fn test_checkpoint_revert_and_replay() {
    let mut world = SimWorld::new(SimConfig::default().with_seed(11).with_atoms(100)).unwrap();
    world.setup().await.unwrap();
    world.run(2).await.unwrap();

    world.checkpoint("cp").unwrap();
    let saved = world.atoms();
    world.run(4).await.unwrap();
    let first = world.atoms();
    assert_ne!(saved, first);

    world.revert("cp").unwrap();
    assert_eq!(world.atoms(), saved);
    world.run(4).await.unwrap();
    assert_same_trajectory(&first, &world.atoms());

    world.discard_checkpoint("cp").unwrap();
    assert!(world.revert("cp").is_err());
}

#[tokio::test]
async fn test_trees_cover_proxies_across_hosts() {
    let config = SimConfig::default().with_layout(3, 3).with_atoms(100);
    let mut world = SimWorld::new(config).unwrap();
    world.setup().await.unwrap();
    world.run(2).await.unwrap();

    let mut with_proxies = 0;
    for node in world.nodes() {
        for home in node.home_patches() {
            let tree = home.tree();
            tree.validate(home.proxies()).unwrap();
            if !home.proxies().is_empty() {
                with_proxies += 1;
                assert!(tree.version >= 1);
                assert_eq!(tree.root, node.id());
            }
        }
    }
    assert!(with_proxies > 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn prop_ownership_holds_for_any_seed(
        seed in any::<u64>(),
        atoms in 1usize..60,
        hosts in 1u32..3,
        nodes_per_host in 1u32..3,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let config = SimConfig::default()
            .with_seed(seed)
            .with_atoms(atoms)
            .with_layout(hosts, nodes_per_host)
            .with_dims([2, 2, 2])
            .with_cell([16.0; 3], [true; 3]);
        let reports = runtime.block_on(async {
            let mut world = SimWorld::new(config).unwrap();
            world.setup().await.unwrap();
            world.run(3).await.unwrap()
        });
        prop_assert_eq!(reports.len(), 3);
        for report in reports {
            prop_assert_eq!(report.atoms, atoms);
        }
    }
}
