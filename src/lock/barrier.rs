use super::{error::LockIndexOutOfRange, LockUnit, LockingDevice};
use std::fmt::{self, Debug};
use tracing::trace;

/** A rectangular grid of tiles, each owning a [`LockUnit`].

Tiles are addressed by column `x` and row `y`, row 0 at the bottom. Every
tile of a row must call the horizontal barrier, every tile of a column the
vertical one:
```
# use syclrt::lock::TileGrid;
let grid = TileGrid::new(3, 2);
std::thread::scope(|s| {
    for tile in grid.tiles() {
        s.spawn(move || tile.barrier());
    }
});
```
*/
pub struct TileGrid {
    width: usize,
    height: usize,
    units: Vec<LockUnit>,
}

impl TileGrid {
    pub const HORIZONTAL_BARRIER_LOCK: usize = 14;
    pub const VERTICAL_BARRIER_LOCK: usize = 15;
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            units: (0..width * height).map(|_| LockUnit::new()).collect(),
        }
    }
    pub fn width(&self) -> usize {
        self.width
    }
    pub fn height(&self) -> usize {
        self.height
    }
    /// The tile at column `x` and row `y`, None if out of the grid.
    pub fn tile(&self, x: usize, y: usize) -> Option<Tile<'_>> {
        if x < self.width && y < self.height {
            Some(Tile { grid: self, x, y })
        } else {
            None
        }
    }
    /// All the tiles, row by row from the bottom.
    pub fn tiles(&self) -> impl Iterator<Item = Tile<'_>> + '_ {
        (0..self.height)
            .flat_map(move |y| (0..self.width).map(move |x| Tile { grid: self, x, y }))
    }
    fn unit(&self, x: usize, y: usize) -> &LockUnit {
        &self.units[y * self.width + x]
    }
}

impl Debug for TileGrid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileGrid")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

/** A tile of a [`TileGrid`].

Barriers pass a token along the line of tiles and back. Each tile waits for
its upstream neighbour on a lock of its own unit, then unleashes its
downstream neighbour through the lock of the neighbour's unit and waits for
the acknowledgment. Odd rows go left to right, even rows right to left, and
columns bottom to top. */
#[derive(Clone, Copy)]
pub struct Tile<'a> {
    grid: &'a TileGrid,
    x: usize,
    y: usize,
}

impl<'a> Tile<'a> {
    pub fn x(&self) -> usize {
        self.x
    }
    pub fn y(&self) -> usize {
        self.y
    }
    /// The lock unit of this tile.
    pub fn unit(&self) -> &'a LockUnit {
        self.grid.unit(self.x, self.y)
    }
    fn lock_at(&self, x: usize, y: usize, lock: usize) -> &'a LockingDevice {
        &self.grid.unit(x, y).locks[lock]
    }
    /// Waits until every tile of the row called it.
    pub fn horizontal_barrier(&self) {
        self.horizontal(TileGrid::HORIZONTAL_BARRIER_LOCK);
    }
    /// Like [`.horizontal_barrier()`](Self::horizontal_barrier) on another lock.
    pub fn horizontal_barrier_with(&self, lock: usize) -> Result<(), LockIndexOutOfRange> {
        self.unit().lock(lock)?;
        self.horizontal(lock);
        Ok(())
    }
    /// Waits until every tile of the column called it.
    pub fn vertical_barrier(&self) {
        self.vertical(TileGrid::VERTICAL_BARRIER_LOCK);
    }
    /// Like [`.vertical_barrier()`](Self::vertical_barrier) on another lock.
    pub fn vertical_barrier_with(&self, lock: usize) -> Result<(), LockIndexOutOfRange> {
        self.unit().lock(lock)?;
        self.vertical(lock);
        Ok(())
    }
    /// A barrier across the whole grid, horizontal then vertical.
    pub fn barrier(&self) {
        self.horizontal_barrier();
        self.vertical_barrier();
    }
    fn horizontal(&self, lock: usize) {
        let (upstream, downstream) = if self.y % 2 == 1 {
            (
                self.x.checked_sub(1),
                Some(self.x + 1).filter(|&x| x < self.grid.width),
            )
        } else {
            (
                Some(self.x + 1).filter(|&x| x < self.grid.width),
                self.x.checked_sub(1),
            )
        };
        trace!(x = self.x, y = self.y, lock, "horizontal barrier");
        self.pass_token(
            upstream.is_some(),
            downstream.map(|x| self.lock_at(x, self.y, lock)),
            lock,
        );
    }
    fn vertical(&self, lock: usize) {
        let downstream = Some(self.y + 1).filter(|&y| y < self.grid.height);
        trace!(x = self.x, y = self.y, lock, "vertical barrier");
        self.pass_token(
            self.y > 0,
            downstream.map(|y| self.lock_at(self.x, y, lock)),
            lock,
        );
    }
    fn pass_token(&self, has_upstream: bool, downstream: Option<&LockingDevice>, lock: usize) {
        let own = self.lock_at(self.x, self.y, lock);
        if has_upstream {
            // Wait for the upstream neighbour.
            own.acquire_with_value(true);
        }
        if let Some(downstream) = downstream {
            downstream.acquire_with_value(false);
            downstream.release_with_value(true);
            // Acknowledged once the whole rest of the line arrived.
            downstream.acquire_with_value(false);
        }
        if has_upstream {
            own.release_with_value(false);
        }
    }
}

impl Debug for Tile<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tile({}, {})", self.x, self.y)
    }
}
